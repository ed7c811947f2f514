//! Small routines shared by every part of the runner.

#[macro_use]
pub mod macros;

/// The name of the flag file whose removal tells the workload to exit.
pub const CHECKPOINT_FLAG_FILE: &str = "checkpoint_flag";

/// The default name of the file the workload creates once it is stable
/// and safe to checkpoint.
pub const CHECKPOINT_READY_FILE: &str = "checkpoint_ready";

/// The name of the pidfile the standalone workload scripts write at
/// startup. PID discovery prefers this over scraping `ps`.
pub const WORKLOAD_PID_FILE: &str = "workload.pid";

/// Parse the first whitespace-delimited token of `out` as a PID.
pub fn parse_pid(out: &str) -> Option<u32> {
    out.split_whitespace().next()?.parse::<u32>().ok()
}

#[cfg(test)]
mod test {
    use super::parse_pid;

    #[test]
    fn pid_parsing() {
        assert_eq!(parse_pid("  4242\n"), Some(4242));
        assert_eq!(parse_pid("4242 1234"), Some(4242));
        assert_eq!(parse_pid(""), None);
        assert_eq!(parse_pid("no-pid-here"), None);
    }
}
