//! Restore-mode policy.
//!
//! All CRIU argument derivation for the lazy/live-migration mode matrix
//! lives here, as one table. The checkpoint manager only concatenates the
//! vectors this module hands out; it never decides flags on its own.

use serde::{Deserialize, Serialize};

/// How page data reaches the restored process.
///
/// The prefetch modes need an object-storage configuration; the
/// live-migration modes need a page-server on the source node. `None`
/// forbids both: no page-server, no lazy-pages daemon.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LazyMode {
    /// Standard restore. Every page must be present locally up front.
    None,
    /// Pages are faulted in on demand from the local images directory.
    Lazy,
    /// Pages are excluded from the bulk transfer and prefetched from
    /// object storage by a worker pool.
    LazyPrefetch,
    /// Post-copy only: pages are served over the network by a
    /// page-server left running on the source node.
    LiveMigration,
    /// Object-storage prefetch (pre-copy) combined with a source-node
    /// page-server (post-copy) for faults the prefetcher has not won yet.
    LiveMigrationPrefetch,
}

impl LazyMode {
    pub fn from_cli(s: &str) -> Result<Self, String> {
        match s {
            "none" => Ok(LazyMode::None),
            "lazy" => Ok(LazyMode::Lazy),
            "lazy-prefetch" => Ok(LazyMode::LazyPrefetch),
            "live-migration" => Ok(LazyMode::LiveMigration),
            "live-migration-prefetch" => Ok(LazyMode::LiveMigrationPrefetch),
            other => Err(format!("unknown lazy mode: {}", other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LazyMode::None => "none",
            LazyMode::Lazy => "lazy",
            LazyMode::LazyPrefetch => "lazy-prefetch",
            LazyMode::LiveMigration => "live-migration",
            LazyMode::LiveMigrationPrefetch => "live-migration-prefetch",
        }
    }
}

/// Everything the mode matrix needs to turn into CRIU argument vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LazyConfig {
    pub mode: LazyMode,

    /// Port the page-server binds on the source node (live migration).
    pub page_server_port: u16,
    /// Address the page-server binds on the source node.
    pub page_server_address: String,

    /// Worker pool size for object-storage prefetch.
    pub prefetch_workers: usize,
}

impl Default for LazyConfig {
    fn default() -> Self {
        LazyConfig {
            mode: LazyMode::None,
            page_server_port: 27,
            page_server_address: "0.0.0.0".into(),
            prefetch_workers: 4,
        }
    }
}

impl LazyConfig {
    pub fn new(mode: LazyMode) -> Self {
        LazyConfig {
            mode,
            ..Default::default()
        }
    }

    /// Does the restore run with a lazy-pages daemon at all?
    pub fn requires_lazy_pages(&self) -> bool {
        self.mode != LazyMode::None
    }

    /// Does the final dump leave a page-server running on the source?
    pub fn requires_page_server(&self) -> bool {
        match self.mode {
            LazyMode::LiveMigration | LazyMode::LiveMigrationPrefetch => true,
            _ => false,
        }
    }

    /// Does the restore side fetch page data from object storage?
    pub fn requires_s3(&self) -> bool {
        match self.mode {
            LazyMode::LazyPrefetch | LazyMode::LiveMigrationPrefetch => true,
            _ => false,
        }
    }

    /// Is the asynchronous prefetch worker pool in play?
    pub fn has_async_prefetch(&self) -> bool {
        self.requires_s3()
    }

    /// Extra arguments for `criu dump`. Non-empty only when the dump must
    /// leave a page-server behind.
    pub fn dump_args(&self) -> Vec<String> {
        if !self.requires_page_server() {
            return vec![];
        }

        vec![
            "--lazy-pages".into(),
            "--address".into(),
            self.page_server_address.clone(),
            "--port".into(),
            self.page_server_port.to_string(),
        ]
    }

    /// Extra arguments for `criu restore`.
    pub fn restore_args(&self) -> Vec<String> {
        if !self.requires_lazy_pages() {
            return vec![];
        }

        vec!["--lazy-pages".into()]
    }

    /// Arguments for the `criu lazy-pages` daemon on the destination.
    /// Object-storage arguments are contributed separately by the
    /// storage configuration.
    pub fn lazy_pages_daemon_args(&self, page_server_host: Option<&str>) -> Vec<String> {
        if !self.requires_lazy_pages() {
            return vec![];
        }

        let mut args = vec![];

        if self.requires_page_server() {
            if let Some(host) = page_server_host {
                args.push("--page-server".into());
                args.push("--address".into());
                args.push(host.into());
                args.push("--port".into());
                args.push(self.page_server_port.to_string());
            }
        }

        if self.has_async_prefetch() {
            args.push("--async-prefetch".into());
            args.push("--prefetch-workers".into());
            args.push(self.prefetch_workers.to_string());
        }

        args
    }
}

#[cfg(test)]
mod test {
    use super::{LazyConfig, LazyMode};

    fn cfg(mode: LazyMode) -> LazyConfig {
        LazyConfig::new(mode)
    }

    #[test]
    fn mode_predicates() {
        assert!(!cfg(LazyMode::None).requires_lazy_pages());
        assert!(cfg(LazyMode::Lazy).requires_lazy_pages());

        for (mode, s3, ps) in &[
            (LazyMode::None, false, false),
            (LazyMode::Lazy, false, false),
            (LazyMode::LazyPrefetch, true, false),
            (LazyMode::LiveMigration, false, true),
            (LazyMode::LiveMigrationPrefetch, true, true),
        ] {
            assert_eq!(cfg(*mode).requires_s3(), *s3, "{:?}", mode);
            assert_eq!(cfg(*mode).requires_page_server(), *ps, "{:?}", mode);
        }
    }

    #[test]
    fn argument_table() {
        let src = Some("10.0.0.1");

        let none = cfg(LazyMode::None);
        assert!(none.dump_args().is_empty());
        assert!(none.restore_args().is_empty());
        assert!(none.lazy_pages_daemon_args(src).is_empty());

        let lazy = cfg(LazyMode::Lazy);
        assert!(lazy.dump_args().is_empty());
        assert_eq!(lazy.restore_args(), vec!["--lazy-pages"]);
        assert!(lazy.lazy_pages_daemon_args(src).is_empty());

        let prefetch = cfg(LazyMode::LazyPrefetch);
        assert!(prefetch.dump_args().is_empty());
        assert_eq!(prefetch.restore_args(), vec!["--lazy-pages"]);
        assert_eq!(
            prefetch.lazy_pages_daemon_args(src),
            vec!["--async-prefetch", "--prefetch-workers", "4"]
        );

        let live = cfg(LazyMode::LiveMigration);
        assert_eq!(
            live.dump_args(),
            vec!["--lazy-pages", "--address", "0.0.0.0", "--port", "27"]
        );
        assert_eq!(live.restore_args(), vec!["--lazy-pages"]);
        assert_eq!(
            live.lazy_pages_daemon_args(src),
            vec!["--page-server", "--address", "10.0.0.1", "--port", "27"]
        );

        let both = cfg(LazyMode::LiveMigrationPrefetch);
        assert_eq!(
            both.dump_args(),
            vec!["--lazy-pages", "--address", "0.0.0.0", "--port", "27"]
        );
        assert_eq!(both.restore_args(), vec!["--lazy-pages"]);
        assert_eq!(
            both.lazy_pages_daemon_args(src),
            vec![
                "--page-server",
                "--address",
                "10.0.0.1",
                "--port",
                "27",
                "--async-prefetch",
                "--prefetch-workers",
                "4"
            ]
        );
    }

    #[test]
    fn roundtrips_through_json() {
        let cfg = LazyConfig::new(LazyMode::LiveMigrationPrefetch);
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"live-migration-prefetch\""));
        let back: LazyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mode, LazyMode::LiveMigrationPrefetch);
        assert_eq!(back.page_server_port, 27);
    }
}
