//! Supervising a dirty-page sampler on the source host.
//!
//! The sampler itself runs out-of-process on the remote machine and uses
//! the kernel's soft-dirty mechanism (clear via `/proc/{pid}/clear_refs`,
//! read via pagemap bit 55), following the target's process tree. Three
//! interchangeable backends exist; the supervisor probes for them and
//! picks the fastest one present. Everything here is best-effort: a
//! tracker that fails to start or stop degrades the run to "no dirty
//! data", never aborts it.

use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::remote::SshPool;

/// Remote path the sampler writes its JSON output to.
pub const TRACKER_OUTPUT_FILE: &str = "/tmp/dirty_pattern.json";

const TRACKER_BASE_DIR: &str = "/opt/criu_workload";

/// Tracker backends, in preference order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerBackend {
    /// Native PAGEMAP_SCAN sampler; fastest, needs a recent kernel.
    C,
    /// Native soft-dirty sampler; portable.
    Go,
    /// Scripted soft-dirty sampler; always available fallback.
    Python,
}

impl TrackerBackend {
    const ALL: [TrackerBackend; 3] =
        [TrackerBackend::C, TrackerBackend::Go, TrackerBackend::Python];

    fn path(self) -> String {
        let rel = match self {
            TrackerBackend::C => "criu_workload/tools/dirty_tracker_c/dirty_tracker",
            TrackerBackend::Go => "criu_workload/tools/dirty_tracker_go/dirty_tracker",
            TrackerBackend::Python => "tools/dirty_tracker.py",
        };
        dir!(TRACKER_BASE_DIR, rel)
    }

    fn command(
        self,
        pid: u32,
        interval_ms: u64,
        workload: &str,
        duration_secs: u64,
    ) -> String {
        let path = self.path();
        match self {
            TrackerBackend::C => format!(
                "sudo {} -p {} -i {} -d {} -w {} -o {}",
                path, pid, interval_ms, duration_secs, workload, TRACKER_OUTPUT_FILE
            ),
            TrackerBackend::Go => format!(
                "sudo {} -pid {} -interval {} -duration {} -workload {} -output {}",
                path, pid, interval_ms, duration_secs, workload, TRACKER_OUTPUT_FILE
            ),
            TrackerBackend::Python => format!(
                "sudo python3 {} --pid {} --interval {} --duration {} --workload {} --output {}",
                path, pid, interval_ms, duration_secs, workload, TRACKER_OUTPUT_FILE
            ),
        }
    }
}

pub struct DirtyTracker {
    host: String,
    backend: Option<TrackerBackend>,
    tracker_pid: Option<u32>,
}

impl DirtyTracker {
    pub fn new(host: &str) -> Self {
        DirtyTracker {
            host: host.to_owned(),
            backend: None,
            tracker_pid: None,
        }
    }

    pub fn backend(&self) -> Option<TrackerBackend> {
        self.backend
    }

    fn probe(&self, pool: &mut SshPool) -> Option<TrackerBackend> {
        for backend in &TrackerBackend::ALL {
            let check = format!("test -x {} && echo exists", backend.path());
            match pool.exec(&self.host, &check, Some(5)) {
                Ok(out) if out.stdout.contains("exists") => {
                    info!("selected dirty tracker backend: {:?}", backend);
                    return Some(*backend);
                }
                _ => {}
            }
        }
        warn!("no dirty tracker backend found on {}", self.host);
        None
    }

    /// Start sampling `target_pid`. Returns false (and logs) when no
    /// backend is available or the start fails; the run continues
    /// without tracking.
    pub fn start(
        &mut self,
        pool: &mut SshPool,
        target_pid: u32,
        interval_ms: u64,
        workload: &str,
        max_duration_secs: u64,
    ) -> bool {
        let backend = match self.probe(pool) {
            Some(backend) => backend,
            None => return false,
        };

        let tracker_cmd = backend.command(target_pid, interval_ms, workload, max_duration_secs);
        let launch = format!(
            "nohup {} > /tmp/dirty_tracker.log 2>&1 & echo $!",
            tracker_cmd
        );

        match pool.exec(&self.host, &launch, None) {
            Ok(out) => match crate::common::parse_pid(&out.stdout) {
                Some(pid) => {
                    info!(
                        "dirty tracking started on {} (tracker pid {}, every {}ms)",
                        self.host, pid, interval_ms
                    );
                    self.backend = Some(backend);
                    self.tracker_pid = Some(pid);
                    true
                }
                None => {
                    warn!("dirty tracker produced no pid: {:?}", out.stdout);
                    false
                }
            },
            Err(err) => {
                warn!("failed to start dirty tracking: {}", err);
                false
            }
        }
    }

    /// SIGTERM the sampler so it can flush its JSON output.
    pub fn stop(&mut self, pool: &mut SshPool) {
        let pid = match self.tracker_pid.take() {
            Some(pid) => pid,
            None => return,
        };

        let kill = format!("sudo kill -TERM {} 2>/dev/null || true", pid);
        if let Err(err) = pool.exec(&self.host, &kill, Some(10)) {
            warn!("failed to stop dirty tracking: {}", err);
            return;
        }

        // Give the sampler a moment to write its output.
        std::thread::sleep(std::time::Duration::from_secs(1));
        info!("dirty tracking stopped on {}", self.host);
    }

    /// Fetch the sampler's JSON output to `local_file`.
    pub fn collect_results(&self, pool: &mut SshPool, local_file: &Path) -> bool {
        match pool.download_file(&self.host, TRACKER_OUTPUT_FILE, local_file) {
            Ok(()) => {
                info!("collected dirty pattern to {}", local_file.display());
                true
            }
            Err(err) => {
                warn!("failed to collect dirty pattern: {}", err);
                false
            }
        }
    }
}

// The sampler's output document. Typed so collected JSON can be loaded
// and joined with the run's other telemetry.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirtyPage {
    pub addr: u64,
    pub vma_type: String,
    #[serde(default)]
    pub vma_perms: String,
    #[serde(default)]
    pub pathname: String,
    #[serde(default = "default_page_size")]
    pub size: u64,
}

fn default_page_size() -> u64 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirtySample {
    pub timestamp_ms: f64,
    #[serde(default)]
    pub dirty_pages: Vec<DirtyPage>,
    pub delta_dirty_count: u64,
    #[serde(default)]
    pub pids_tracked: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerSummary {
    #[serde(default)]
    pub total_unique_pages: u64,
    #[serde(default)]
    pub total_dirty_events: u64,
    #[serde(default)]
    pub total_dirty_size_bytes: u64,
    #[serde(default)]
    pub avg_dirty_rate_per_sec: f64,
    #[serde(default)]
    pub peak_dirty_rate: f64,
    #[serde(default)]
    pub vma_distribution: std::collections::BTreeMap<String, f64>,
    #[serde(default)]
    pub sample_count: u64,
    #[serde(default)]
    pub interval_ms: f64,
    #[serde(default)]
    pub max_processes_tracked: u64,
    #[serde(default)]
    pub total_pids_seen: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatePoint {
    pub timestamp_ms: f64,
    pub rate_pages_per_sec: f64,
    pub cumulative_pages: u64,
    #[serde(default)]
    pub processes_tracked: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirtyPattern {
    pub workload: String,
    /// Root PID of the tracked tree.
    pub pid: u32,
    pub tracking_duration_ms: f64,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default)]
    pub track_children: bool,
    #[serde(default)]
    pub samples: Vec<DirtySample>,
    #[serde(default)]
    pub summary: TrackerSummary,
    #[serde(default)]
    pub dirty_rate_timeline: Vec<RatePoint>,
}

impl DirtyPattern {
    pub fn load(path: &Path) -> Result<Self, failure::Error> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod test {
    use super::{DirtyPattern, TrackerBackend};

    #[test]
    fn backend_commands_carry_comparable_flags() {
        let c = TrackerBackend::C.command(4242, 100, "memory", 3600);
        assert!(c.contains("-p 4242") && c.contains("-i 100") && c.contains("-o /tmp/dirty_pattern.json"));

        let go = TrackerBackend::Go.command(4242, 100, "memory", 3600);
        assert!(go.contains("-pid 4242") && go.contains("-interval 100"));

        let py = TrackerBackend::Python.command(4242, 100, "memory", 3600);
        assert!(py.starts_with("sudo python3"));
        assert!(py.contains("--pid 4242") && py.contains("--workload memory"));
    }

    #[test]
    fn pattern_document_loads() {
        let json = r#"{
            "workload": "memory",
            "pid": 4242,
            "tracking_duration_ms": 2500.0,
            "page_size": 4096,
            "track_children": true,
            "samples": [
                {
                    "timestamp_ms": 100.0,
                    "dirty_pages": [
                        {"addr": 140737488355328, "vma_type": "heap", "vma_perms": "rw-p", "pathname": "[heap]"}
                    ],
                    "delta_dirty_count": 1,
                    "pids_tracked": [4242]
                }
            ],
            "summary": {
                "total_unique_pages": 1,
                "total_dirty_events": 1,
                "avg_dirty_rate_per_sec": 10.0,
                "peak_dirty_rate": 10.0,
                "vma_distribution": {"heap": 1.0},
                "max_processes_tracked": 1,
                "total_pids_seen": [4242]
            },
            "dirty_rate_timeline": [
                {"timestamp_ms": 100.0, "rate_pages_per_sec": 10.0, "cumulative_pages": 1, "processes_tracked": 1}
            ]
        }"#;

        let pattern: DirtyPattern = serde_json::from_str(json).unwrap();
        assert_eq!(pattern.pid, 4242);
        assert!(pattern.summary.avg_dirty_rate_per_sec >= 0.0);
        assert!(pattern.summary.total_pids_seen.contains(&4242));
        assert_eq!(pattern.samples[0].dirty_pages[0].vma_type, "heap");
        assert_eq!(pattern.samples[0].dirty_pages[0].size, 4096);
    }
}
