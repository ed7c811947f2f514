//! Driving CRIU and its helper daemons on the experiment hosts.
//!
//! The manager owns the SSH pool and sequences everything CRIU-shaped:
//! workload launch and readiness, the pre-dump chain, the final dump
//! (synchronous, or backgrounded behind a page-server with a
//! file-quiescence wait), restore with its lazy-pages daemon ordering,
//! verification, log capture, and cleanup.
//!
//! Checkpoint sets are numbered directories `working_dir/1..N`; directory
//! N with N>1 references `../{N-1}` as its predecessor and the
//! highest-numbered one is the final checkpoint.

use std::path::Path;
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Serialize;
use spurs::cmd;

use crate::error::RunnerError;
use crate::lazy::LazyConfig;
use crate::objstore::S3Config;
use crate::remote::SshPool;
use crate::telemetry::LogFiles;
use crate::workloads::WorkloadKind;

/// Pidfile CRIU writes inside the images directory on restore.
pub const RESTORED_PID_FILE: &str = "restored.pid";

/// Process states `ps` reports for a live process.
const ALIVE_STATES: [&str; 5] = ["R", "S", "D", "T", "Z"];

/// Every timeout the pipeline uses, in seconds. Defaults match the
/// behavior this tooling has always had; override from the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct Timeouts {
    pub ready_secs: u64,
    pub pre_dump_secs: u64,
    pub final_dump_secs: u64,
    pub restore_secs: u64,
    pub target_memory_secs: u64,
    pub lazy_pages_secs: u64,
    pub quiescence_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            ready_secs: 300,
            pre_dump_secs: 120,
            final_dump_secs: 300,
            restore_secs: 300,
            target_memory_secs: 600,
            lazy_pages_secs: 300,
            quiescence_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DumpRecord {
    pub iteration: usize,
    pub duration_secs: f64,
    pub checkpoint_dir: String,
    pub lazy_pages: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreRecord {
    pub duration_secs: f64,
    pub checkpoint_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyRecord {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub verification_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub healthy: bool,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dbsize: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LazyPagesRecord {
    pub completed: bool,
    pub duration_secs: f64,
}

pub struct CheckpointManager {
    pool: SshPool,
    working_dir: String,
    timeouts: Timeouts,
}

impl CheckpointManager {
    pub fn new(ssh_user: &str, working_dir: &str, timeouts: Timeouts) -> Self {
        CheckpointManager {
            pool: SshPool::new(ssh_user),
            working_dir: working_dir.to_owned(),
            timeouts,
        }
    }

    pub fn pool_mut(&mut self) -> &mut SshPool {
        &mut self.pool
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn checkpoint_dir(&self, iteration: usize) -> String {
        format!("{}/{}", self.working_dir, iteration)
    }

    /// Remove and recreate the working directory on `host`.
    pub fn prepare(&mut self, host: &str) -> Result<(), failure::Error> {
        info!("preparing {} on {}", self.working_dir, host);
        with_shell! { self.pool, host =>
            cmd!("rm -rf {}", self.working_dir),
            cmd!("mkdir -p {}", self.working_dir),
        }
        Ok(())
    }

    /// Launch the workload in the background on `host` and discover its
    /// PID: the pidfile the standalone scripts write, with a `ps` scrape
    /// as the fallback (best-effort; a command line matching itself is a
    /// known hazard of the scrape).
    pub fn start_workload(&mut self, host: &str, command: &str) -> Result<u32, failure::Error> {
        self.pool.run(
            host,
            cmd!("touch {}/{}", self.working_dir, crate::common::CHECKPOINT_FLAG_FILE),
        )?;

        self.pool
            .exec_background(host, &format!("cd {} && nohup {}", self.working_dir, command))?;

        // Let the interpreter come up and write its pidfile.
        std::thread::sleep(Duration::from_secs(2));

        let pidfile = format!("{}/{}", self.working_dir, crate::common::WORKLOAD_PID_FILE);
        let out = self.pool.exec(host, &format!("cat {}", pidfile), Some(10))?;
        if let Some(pid) = crate::common::parse_pid(&out.stdout) {
            info!("workload started on {} with pid {} (pidfile)", host, pid);
            return Ok(pid);
        }

        let scrape = format!(
            "ps -ef | grep '{}' | grep -v grep | awk '{{print $2}}' | tail -n 1",
            command
        );
        let out = self.pool.exec(host, &scrape, Some(10))?;
        match crate::common::parse_pid(&out.stdout) {
            Some(pid) => {
                info!("workload started on {} with pid {} (ps scrape)", host, pid);
                Ok(pid)
            }
            None => Err(failure::format_err!(
                "no PID found on {} for workload command: {}",
                host,
                command
            )),
        }
    }

    /// Poll for the workload's readiness file.
    pub fn wait_for_ready(&mut self, host: &str, ready_file: &str) -> Result<(), failure::Error> {
        let path = format!("{}/{}", self.working_dir, ready_file);
        let timeout = Duration::from_secs(self.timeouts.ready_secs);
        let start = Instant::now();

        while start.elapsed() < timeout {
            let out = self
                .pool
                .exec(host, &format!("test -f {} && echo exists", path), Some(10))?;
            if out.stdout.contains("exists") {
                info!("workload ready on {}", host);
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(500));
        }

        Err(RunnerError::ReadyTimeout {
            host: host.to_owned(),
            waited_secs: self.timeouts.ready_secs,
        }
        .into())
    }

    /// Incremental checkpoint number `iteration` (1-indexed).
    pub fn pre_dump(
        &mut self,
        host: &str,
        pid: u32,
        iteration: usize,
        kind: WorkloadKind,
    ) -> Result<DumpRecord, failure::Error> {
        let checkpoint_dir = self.checkpoint_dir(iteration);
        self.pool.run(host, cmd!("mkdir -p {}", checkpoint_dir))?;

        let criu = pre_dump_cmd(&self.working_dir, iteration, pid, kind.needs_tcp_established());
        info!("pre-dump {} on {}", iteration, host);

        let duration_secs = self.run_criu_phase(
            host,
            &format!("pre-dump {}", iteration),
            &criu,
            &checkpoint_dir,
            "criu-pre-dump.log",
            self.timeouts.pre_dump_secs,
        )?;

        info!("pre-dump {} completed in {:.2}s", iteration, duration_secs);
        Ok(DumpRecord {
            iteration,
            duration_secs,
            checkpoint_dir,
            lazy_pages: false,
        })
    }

    /// The final dump, into directory `last_iteration + 1`. When the lazy
    /// mode wants a page-server the dump is backgrounded (CRIU stays
    /// alive serving pages) and completion is detected by the working
    /// directory going quiet.
    pub fn final_dump(
        &mut self,
        host: &str,
        pid: u32,
        last_iteration: usize,
        lazy: &LazyConfig,
        kind: WorkloadKind,
    ) -> Result<DumpRecord, failure::Error> {
        let iteration = last_iteration + 1;
        let checkpoint_dir = self.checkpoint_dir(iteration);
        self.pool.run(host, cmd!("mkdir -p {}", checkpoint_dir))?;

        let criu = dump_cmd(
            &self.working_dir,
            iteration,
            pid,
            last_iteration,
            lazy,
            kind.needs_tcp_established(),
        );

        info!(
            "final dump on {} (iteration {}, mode {})",
            host,
            iteration,
            lazy.mode.as_str()
        );

        let duration_secs = if lazy.requires_page_server() {
            let start = Instant::now();
            self.pool.exec_background(host, &criu)?;

            let working_dir = self.working_dir.clone();
            let host_owned = host.to_owned();
            let pool = &mut self.pool;
            let sample = move || -> Result<Option<u64>, failure::Error> {
                let find = format!(
                    "find {} -type f -exec stat --format='%Y' {{}} + 2>/dev/null | sort -nr | head -n 1",
                    working_dir
                );
                let out = pool.exec(&host_owned, &find, Some(30))?;
                Ok(out.stdout.trim().parse::<u64>().ok())
            };

            wait_for_mtime_quiescence(
                sample,
                Duration::from_secs(2),
                Duration::from_millis(500),
                Duration::from_secs(self.timeouts.quiescence_secs),
            )?;

            let _ = self
                .pool
                .exec(host, &format!("sudo chmod -R a+r {}", checkpoint_dir), Some(30));

            start.elapsed().as_secs_f64()
        } else {
            self.run_criu_phase(
                host,
                "final dump",
                &criu,
                &checkpoint_dir,
                "criu-dump.log",
                self.timeouts.final_dump_secs,
            )?
        };

        info!("final dump completed in {:.2}s", duration_secs);
        Ok(DumpRecord {
            iteration,
            duration_secs,
            checkpoint_dir,
            lazy_pages: lazy.requires_page_server(),
        })
    }

    /// Restore on `host` from `checkpoint_dir`. For lazy modes the
    /// lazy-pages daemon comes up first (pointed at the source
    /// page-server for live migration), settles, and only then is the
    /// detached restore invoked.
    pub fn restore(
        &mut self,
        host: &str,
        checkpoint_dir: &str,
        lazy: &LazyConfig,
        page_server_host: Option<&str>,
        kind: WorkloadKind,
    ) -> Result<RestoreRecord, failure::Error> {
        let daemon_args = lazy.lazy_pages_daemon_args(page_server_host);
        self.restore_inner(host, checkpoint_dir, lazy, daemon_args, kind)
    }

    /// Restore with page data coming from object storage: the daemon
    /// additionally gets the storage argument vector (and, for combined
    /// live migration, still connects to the source page-server).
    pub fn restore_with_s3(
        &mut self,
        host: &str,
        checkpoint_dir: &str,
        s3: &S3Config,
        lazy: &LazyConfig,
        page_server_host: Option<&str>,
        kind: WorkloadKind,
    ) -> Result<RestoreRecord, failure::Error> {
        let mut daemon_args = lazy.lazy_pages_daemon_args(page_server_host);
        daemon_args.extend(s3.criu_object_storage_args());
        self.restore_inner(host, checkpoint_dir, lazy, daemon_args, kind)
    }

    fn restore_inner(
        &mut self,
        host: &str,
        checkpoint_dir: &str,
        lazy: &LazyConfig,
        daemon_args: Vec<String>,
        kind: WorkloadKind,
    ) -> Result<RestoreRecord, failure::Error> {
        if lazy.requires_lazy_pages() {
            let daemon = lazy_pages_daemon_cmd(checkpoint_dir, &daemon_args);
            info!("starting lazy-pages daemon on {}", host);
            self.pool.exec_background(host, &daemon)?;
            // Let the daemon bind its socket before restore connects.
            std::thread::sleep(Duration::from_secs(2));
        }

        let criu = restore_cmd(
            checkpoint_dir,
            lazy,
            kind.needs_tcp_established(),
            RESTORED_PID_FILE,
        );
        info!("restoring on {} from {}", host, checkpoint_dir);

        let duration_secs = self.run_criu_phase(
            host,
            "restore",
            &criu,
            checkpoint_dir,
            "criu-restore.log",
            self.timeouts.restore_secs,
        )?;

        info!("restore completed in {:.2}s", duration_secs);
        Ok(RestoreRecord {
            duration_secs,
            checkpoint_dir: checkpoint_dir.to_owned(),
        })
    }

    /// Check the restored process is alive. Observational: failure is a
    /// record, not an error.
    pub fn verify_restore(
        &mut self,
        host: &str,
        checkpoint_dir: &str,
        pid: Option<u32>,
        timeout_secs: u64,
    ) -> VerifyRecord {
        let start = Instant::now();

        let pid = pid.or_else(|| {
            let pidfile = format!("{}/{}", checkpoint_dir, RESTORED_PID_FILE);
            match self.pool.exec(host, &format!("cat {} 2>/dev/null", pidfile), Some(10)) {
                Ok(out) => crate::common::parse_pid(&out.stdout),
                Err(_) => None,
            }
        });

        let pid = match pid {
            Some(pid) => pid,
            None => {
                warn!("no PID available to verify the restore on {}", host);
                return VerifyRecord {
                    verified: false,
                    pid: None,
                    state: None,
                    verification_secs: start.elapsed().as_secs_f64(),
                };
            }
        };

        while start.elapsed() < Duration::from_secs(timeout_secs) {
            let probe = format!("ps -p {} -o state= 2>/dev/null", pid);
            if let Ok(out) = self.pool.exec(host, &probe, Some(10)) {
                let state = out.stdout.trim().to_owned();
                if ALIVE_STATES.iter().any(|s| state.starts_with(s)) {
                    info!("process {} verified running on {} (state {})", pid, host, state);
                    return VerifyRecord {
                        verified: true,
                        pid: Some(pid),
                        state: Some(state),
                        verification_secs: start.elapsed().as_secs_f64(),
                    };
                }
            }
            std::thread::sleep(Duration::from_millis(500));
        }

        warn!("process {} not seen alive on {} within {}s", pid, host, timeout_secs);
        VerifyRecord {
            verified: false,
            pid: Some(pid),
            state: None,
            verification_secs: start.elapsed().as_secs_f64(),
        }
    }

    /// Protocol-level health of the restored workload.
    pub fn verify_workload_health(
        &mut self,
        host: &str,
        kind: WorkloadKind,
        redis_port: u16,
    ) -> HealthRecord {
        match kind {
            WorkloadKind::Redis => {
                let ping = format!("redis-cli -p {} ping 2>/dev/null", redis_port);
                match self.pool.exec(host, &ping, Some(10)) {
                    Ok(out) if out.stdout.contains("PONG") => {
                        let dbsize = self
                            .pool
                            .exec(host, &format!("redis-cli -p {} dbsize 2>/dev/null", redis_port), Some(10))
                            .ok()
                            .filter(|o| o.ok())
                            .map(|o| o.stdout.trim().to_owned());
                        HealthRecord {
                            healthy: true,
                            service: "redis".into(),
                            response: Some("PONG".into()),
                            dbsize,
                            pid: None,
                            error: None,
                        }
                    }
                    Ok(out) => HealthRecord {
                        healthy: false,
                        service: "redis".into(),
                        response: None,
                        dbsize: None,
                        pid: None,
                        error: Some(if out.stderr.trim().is_empty() {
                            "no PONG response".into()
                        } else {
                            out.stderr.trim().to_owned()
                        }),
                    },
                    Err(err) => HealthRecord {
                        healthy: false,
                        service: "redis".into(),
                        response: None,
                        dbsize: None,
                        pid: None,
                        error: Some(err.to_string()),
                    },
                }
            }

            WorkloadKind::Video => self.pgrep_health(host, "ffmpeg", "pgrep -x ffmpeg"),

            _ => {
                let pattern = kind.process_pattern();
                let probe = format!("pgrep -f '{}'", pattern);
                self.pgrep_health(host, kind.as_str(), &probe)
            }
        }
    }

    fn pgrep_health(&mut self, host: &str, service: &str, probe: &str) -> HealthRecord {
        match self.pool.exec(host, probe, Some(10)) {
            Ok(out) if out.ok() && !out.stdout.trim().is_empty() => HealthRecord {
                healthy: true,
                service: service.to_owned(),
                response: None,
                dbsize: None,
                pid: Some(out.stdout.trim().to_owned()),
                error: None,
            },
            _ => HealthRecord {
                healthy: false,
                service: service.to_owned(),
                response: None,
                dbsize: None,
                pid: None,
                error: Some(format!("{} process not found", service)),
            },
        }
    }

    /// Wait for the lazy-pages daemon to finish serving; its absence from
    /// the process table is the completion signal.
    pub fn wait_for_lazy_pages_complete(&mut self, host: &str) -> LazyPagesRecord {
        let start = Instant::now();
        let timeout = Duration::from_secs(self.timeouts.lazy_pages_secs);

        while start.elapsed() < timeout {
            match self.pool.exec(host, "pgrep -f 'criu lazy-pages'", Some(10)) {
                Ok(out) if out.stdout.trim().is_empty() => {
                    let duration_secs = start.elapsed().as_secs_f64();
                    info!("lazy-pages completed in {:.2}s", duration_secs);
                    return LazyPagesRecord {
                        completed: true,
                        duration_secs,
                    };
                }
                _ => {}
            }
            std::thread::sleep(Duration::from_millis(500));
        }

        warn!("lazy-pages still running after {}s", self.timeouts.lazy_pages_secs);
        LazyPagesRecord {
            completed: false,
            duration_secs: start.elapsed().as_secs_f64(),
        }
    }

    /// Sample the workload's stdout writes and /proc status without
    /// holding a pipe to it: a short strace attach, detached well before
    /// any dump. Best-effort.
    pub fn capture_workload_log(&mut self, host: &str, pid: u32, label: &str, strace_secs: u64) {
        let strace_log = format!("{}/workload_stdout_{}.log", self.working_dir, label);
        let strace = format!(
            "sudo timeout {} strace -p {} -e trace=write -e write=1,2 -o {}",
            strace_secs, pid, strace_log
        );
        if let Err(err) = self.pool.exec(host, &strace, Some(strace_secs + 15)) {
            warn!("strace capture failed on {}: {}", host, err);
        }

        let status_log = format!("{}/workload_status_{}.log", self.working_dir, label);
        let status = format!(
            "grep -E 'VmRSS|VmSize|VmPeak|Threads' /proc/{}/status > {} 2>/dev/null",
            pid, status_log
        );
        if let Err(err) = self.pool.exec(host, &status, Some(10)) {
            warn!("status capture failed on {}: {}", host, err);
        }
    }

    /// Fetch every CRIU and workload log from both hosts into a
    /// timestamped directory, split by originating host: dump-side logs
    /// under `source/`, restore-side logs under `dest/`. Per-file
    /// failures skip the file.
    pub fn collect_logs(
        &mut self,
        source_host: &str,
        dest_host: &str,
        output_dir: &str,
        experiment_name: Option<&str>,
    ) -> LogFiles {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let run_dir_name = match experiment_name {
            Some(name) => format!("{}_{}", name, stamp),
            None => stamp.to_string(),
        };
        let run_dir = Path::new(output_dir).join(run_dir_name);

        let mut collected = LogFiles {
            output_dir: run_dir.display().to_string(),
            source: Vec::new(),
            dest: Vec::new(),
        };

        let working_dir = self.working_dir.clone();
        for (host, bucket) in &[(source_host, "source"), (dest_host, "dest")] {
            let local = run_dir.join(bucket);
            match self.pool.download_dir(host, &working_dir, &local, ".log") {
                Ok(files) => {
                    let files: Vec<String> =
                        files.into_iter().map(|p| p.display().to_string()).collect();
                    info!("collected {} log files from {}", files.len(), host);
                    if *bucket == "source" {
                        collected.source = files;
                    } else {
                        collected.dest = files;
                    }
                }
                Err(err) => warn!("log collection from {} failed: {}", host, err),
            }
        }

        collected
    }

    /// Best-effort, idempotent teardown of workload and CRIU helper
    /// processes on `host`.
    pub fn cleanup_processes(&mut self, host: &str, kind: WorkloadKind) {
        let mut patterns = vec![kind.process_pattern()];
        match kind {
            WorkloadKind::Redis => patterns.push("redis-server".to_owned()),
            WorkloadKind::Video => patterns.push("ffmpeg".to_owned()),
            _ => {}
        }

        for pattern in patterns {
            let _ = self
                .pool
                .exec(host, &format!("pkill -f '{}' || true", pattern), Some(10));
        }
        let _ = self
            .pool
            .exec(host, "sudo pkill -f 'criu lazy-pages' || true", Some(10));
    }

    pub fn close_all_connections(&mut self) {
        self.pool.close_all();
    }

    fn run_criu_phase(
        &mut self,
        host: &str,
        phase: &str,
        criu_cmd: &str,
        checkpoint_dir: &str,
        log_name: &str,
        timeout_secs: u64,
    ) -> Result<f64, failure::Error> {
        let start = Instant::now();
        let out = self.pool.exec(host, criu_cmd, Some(timeout_secs))?;
        let duration_secs = start.elapsed().as_secs_f64();

        // CRIU runs as root; loosen permissions so the log files are
        // readable for the tail below and for collection later. This has
        // to happen on success too.
        let _ = self
            .pool
            .exec(host, &format!("sudo chmod -R a+r {}", checkpoint_dir), Some(30));

        if !out.ok() {
            let log_path = format!("{}/{}", checkpoint_dir, log_name);
            let log_tail = self.log_tail(host, &log_path, 30);
            let detail = if out.status == 124 {
                format!("timed out after {}s", timeout_secs)
            } else {
                let stderr = out.stderr.trim();
                if stderr.is_empty() {
                    format!("exit status {}", out.status)
                } else {
                    stderr.to_owned()
                }
            };
            return Err(RunnerError::CriuPhase {
                phase: phase.to_owned(),
                duration_secs,
                detail,
                log_tail,
            }
            .into());
        }

        Ok(duration_secs)
    }

    fn log_tail(&mut self, host: &str, path: &str, lines: usize) -> String {
        match self.pool.exec(host, &format!("tail -n {} {}", lines, path), Some(30)) {
            Ok(out) => out.stdout,
            Err(_) => String::new(),
        }
    }
}

/// `criu pre-dump` invocation for checkpoint directory `iteration`.
pub fn pre_dump_cmd(working_dir: &str, iteration: usize, pid: u32, tcp_established: bool) -> String {
    let dir = format!("{}/{}", working_dir, iteration);
    let mut cmd = format!(
        "sudo criu pre-dump -D {dir} -t {pid} --shell-job --track-mem \
         --log-file {dir}/criu-pre-dump.log -v4",
        dir = dir,
        pid = pid
    );
    if iteration > 1 {
        cmd.push_str(&format!(" --prev-images-dir ../{}", iteration - 1));
    }
    if tcp_established {
        cmd.push_str(" --tcp-established");
    }
    cmd
}

/// `criu dump` invocation for the final checkpoint.
pub fn dump_cmd(
    working_dir: &str,
    iteration: usize,
    pid: u32,
    last_iteration: usize,
    lazy: &LazyConfig,
    tcp_established: bool,
) -> String {
    let dir = format!("{}/{}", working_dir, iteration);
    let mut cmd = format!(
        "sudo criu dump -D {dir} -t {pid} --shell-job --track-mem \
         --log-file {dir}/criu-dump.log -v4",
        dir = dir,
        pid = pid
    );
    if last_iteration > 0 {
        cmd.push_str(&format!(" --prev-images-dir ../{}", last_iteration));
    }
    for arg in lazy.dump_args() {
        cmd.push(' ');
        cmd.push_str(&arg);
    }
    if tcp_established {
        cmd.push_str(" --tcp-established");
    }
    cmd
}

/// `criu restore` invocation. `-d` detaches so the measured time is the
/// restore itself, not the workload's lifetime.
pub fn restore_cmd(
    checkpoint_dir: &str,
    lazy: &LazyConfig,
    tcp_established: bool,
    pidfile: &str,
) -> String {
    let mut cmd = format!(
        "sudo criu restore -D {dir} --shell-job -d --log-file {dir}/criu-restore.log -v4 \
         --pidfile {pidfile}",
        dir = checkpoint_dir,
        pidfile = pidfile
    );
    for arg in lazy.restore_args() {
        cmd.push(' ');
        cmd.push_str(&arg);
    }
    if tcp_established {
        cmd.push_str(" --tcp-established");
    }
    cmd
}

/// `criu lazy-pages` daemon invocation.
pub fn lazy_pages_daemon_cmd(checkpoint_dir: &str, daemon_args: &[String]) -> String {
    let mut cmd = format!(
        "sudo criu lazy-pages --images-dir {dir} --log-file {dir}/criu-lazy-pages.log -v4",
        dir = checkpoint_dir
    );
    for arg in daemon_args {
        cmd.push(' ');
        cmd.push_str(arg);
    }
    cmd
}

/// Poll `latest_mtime` until the reported value has not advanced for
/// `stable_window`. Returns the total wall time waited, or a quiescence
/// timeout. The loop never returns before a full stable window has been
/// observed.
pub fn wait_for_mtime_quiescence<F>(
    mut latest_mtime: F,
    stable_window: Duration,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<Duration, failure::Error>
where
    F: FnMut() -> Result<Option<u64>, failure::Error>,
{
    let start = Instant::now();
    let mut last_seen: Option<u64> = None;
    let mut stable_since = Instant::now();

    loop {
        let current = latest_mtime()?;
        if current != last_seen {
            last_seen = current;
            stable_since = Instant::now();
        } else if stable_since.elapsed() >= stable_window {
            return Ok(start.elapsed());
        }

        if start.elapsed() >= timeout {
            return Err(RunnerError::QuiescenceTimeout {
                elapsed_secs: start.elapsed().as_secs(),
            }
            .into());
        }

        std::thread::sleep(poll_interval);
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::lazy::{LazyConfig, LazyMode};

    const WD: &str = "/tmp/criu_checkpoint";

    #[test]
    fn pre_dump_chain_references_predecessors() {
        let first = pre_dump_cmd(WD, 1, 4242, false);
        assert_eq!(
            first,
            "sudo criu pre-dump -D /tmp/criu_checkpoint/1 -t 4242 --shell-job --track-mem \
             --log-file /tmp/criu_checkpoint/1/criu-pre-dump.log -v4"
        );

        for n in 2..=5 {
            let cmd = pre_dump_cmd(WD, n, 4242, false);
            assert!(cmd.contains(&format!("-D /tmp/criu_checkpoint/{}", n)));
            assert!(cmd.contains(&format!("--prev-images-dir ../{}", n - 1)));
        }
    }

    #[test]
    fn final_dump_follows_the_chain() {
        // After K pre-dumps the final dump writes K+1 and references K.
        let with_chain = dump_cmd(WD, 3, 4242, 2, &LazyConfig::default(), false);
        assert!(with_chain.contains("-D /tmp/criu_checkpoint/3"));
        assert!(with_chain.contains("--prev-images-dir ../2"));
        assert!(with_chain.contains("--log-file /tmp/criu_checkpoint/3/criu-dump.log"));

        // No pre-dumps: no predecessor reference.
        let solo = dump_cmd(WD, 1, 4242, 0, &LazyConfig::default(), false);
        assert!(!solo.contains("--prev-images-dir"));
    }

    #[test]
    fn live_migration_dump_starts_a_page_server() {
        let lazy = LazyConfig::new(LazyMode::LiveMigration);
        let cmd = dump_cmd(WD, 1, 4242, 0, &lazy, false);
        assert!(cmd.contains("--lazy-pages --address 0.0.0.0 --port 27"));

        let none = dump_cmd(WD, 1, 4242, 0, &LazyConfig::default(), false);
        assert!(!none.contains("--lazy-pages"));
    }

    #[test]
    fn restore_flags_follow_mode_and_workload() {
        let plain = restore_cmd("/tmp/criu_checkpoint/3", &LazyConfig::default(), false, "restored.pid");
        assert_eq!(
            plain,
            "sudo criu restore -D /tmp/criu_checkpoint/3 --shell-job -d \
             --log-file /tmp/criu_checkpoint/3/criu-restore.log -v4 --pidfile restored.pid"
        );

        let lazy = restore_cmd(
            "/tmp/criu_checkpoint/3",
            &LazyConfig::new(LazyMode::Lazy),
            false,
            "restored.pid",
        );
        assert!(lazy.ends_with("--lazy-pages"));

        let redis = restore_cmd(
            "/tmp/criu_checkpoint/3",
            &LazyConfig::new(LazyMode::Lazy),
            true,
            "restored.pid",
        );
        assert!(redis.ends_with("--lazy-pages --tcp-established"));
    }

    #[test]
    fn daemon_command_combines_page_server_and_object_storage() {
        use crate::objstore::{S3Config, S3Kind};

        let lazy = LazyConfig::new(LazyMode::LiveMigrationPrefetch);
        let mut s3 = S3Config::new(S3Kind::Standard, "b", "p");
        s3.download_endpoint = "s3.us-east-1.amazonaws.com".into();

        let mut args = lazy.lazy_pages_daemon_args(Some("10.0.0.1"));
        args.extend(s3.criu_object_storage_args());
        let cmd = lazy_pages_daemon_cmd("/tmp/criu_checkpoint/1", &args);

        assert!(cmd.starts_with(
            "sudo criu lazy-pages --images-dir /tmp/criu_checkpoint/1 \
             --log-file /tmp/criu_checkpoint/1/criu-lazy-pages.log -v4"
        ));
        assert!(cmd.contains("--page-server --address 10.0.0.1 --port 27"));
        assert!(cmd.contains("--async-prefetch --prefetch-workers 4"));
        assert!(cmd.contains("--enable-object-storage"));
        assert!(cmd.contains("--object-storage-bucket b"));
        assert!(cmd.contains("--object-storage-object-prefix p/"));
    }

    #[test]
    fn quiescence_waits_out_a_full_stable_window() {
        let window = Duration::from_millis(50);
        let poll = Duration::from_millis(5);

        // Frozen from the start: returns after at least one window.
        let start = Instant::now();
        let waited = wait_for_mtime_quiescence(
            || Ok(Some(1000)),
            window,
            poll,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(waited >= window);
        assert!(start.elapsed() >= window);
    }

    #[test]
    fn quiescence_does_not_return_while_mtimes_advance() {
        let window = Duration::from_millis(40);
        let poll = Duration::from_millis(5);

        // Advance the mtime for the first 12 samples, then freeze.
        let mut calls = 0u64;
        let freeze_after = 12;
        let sample = move || {
            calls += 1;
            Ok(Some(if calls < freeze_after { calls } else { freeze_after }))
        };

        let waited =
            wait_for_mtime_quiescence(sample, window, poll, Duration::from_secs(5)).unwrap();

        // 11 advancing samples * 5ms of polling, plus a full window.
        assert!(waited >= Duration::from_millis(11 * 5) + window);
    }

    #[test]
    fn quiescence_times_out_when_never_quiet() {
        let mut tick = 0u64;
        let always_moving = move || {
            tick += 1;
            Ok(Some(tick))
        };

        let res = wait_for_mtime_quiescence(
            always_moving,
            Duration::from_millis(50),
            Duration::from_millis(5),
            Duration::from_millis(60),
        );
        assert!(res.is_err());
    }

    #[test]
    fn timeouts_default_to_the_legacy_constants() {
        let t = Timeouts::default();
        assert_eq!(t.pre_dump_secs, 120);
        assert_eq!(t.final_dump_secs, 300);
        assert_eq!(t.restore_secs, 300);
        assert_eq!(t.target_memory_secs, 600);
        assert_eq!(t.ready_secs, 300);
    }
}
