//! Useful macros.

/// Given an ordered list of path components, combine them into a path string.
macro_rules! dir {
    ($first:expr $(, $part:expr)* $(,)?) => {{
        #[allow(unused_mut)]
        let mut path = String::from($first);

        $(
            path.push('/');
            path.extend(String::from($part).chars());
        )*

        path
    }}
}

/// Run a bunch of commands over the same pooled shell on the same host.
macro_rules! with_shell {
    ($pool:expr, $host:expr => $($cmd:expr),+ $(,)?) => {{
        $(
            $pool.run($host, $cmd)?;
        )+
    }}
}
