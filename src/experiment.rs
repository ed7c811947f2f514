//! The migration experiment orchestrator.
//!
//! Sequences a run across the two hosts: prepare, launch and wait for the
//! workload, optionally start dirty tracking, run the checkpoint strategy
//! (a paced pre-dump chain, or a time-/memory-gated full dump), transfer,
//! restore, verify. The pipeline fails fast on anything that would leave
//! a later phase without its input; verification, health checks, and
//! tracking only ever degrade the record.

use std::path::Path;
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::checkpoint::{CheckpointManager, Timeouts};
use crate::lazy::LazyConfig;
use crate::objstore::S3Config;
use crate::telemetry::MetricsCollector;
use crate::tracker::DirtyTracker;
use crate::transfer::{TransferConfig, TransferManager, TransferMethod};
use crate::workloads::{Workload, WorkloadKind, WorkloadSettings};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    /// Iterative pre-dumps, then the final dump.
    Predump,
    /// One full dump, gated by time or by the workload's memory size.
    Full,
}

impl StrategyMode {
    pub fn from_cli(s: &str) -> Result<Self, String> {
        match s {
            "predump" => Ok(StrategyMode::Predump),
            "full" => Ok(StrategyMode::Full),
            other => Err(format!("unknown checkpoint strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyConfig {
    pub mode: StrategyMode,
    pub predump_iterations: usize,
    pub predump_interval_secs: u64,
    /// Sync each pre-dump onto the transfer medium as it completes
    /// (EBS only; EFS is already shared).
    pub sync_after_predump: bool,
    pub wait_before_dump_secs: u64,
    pub target_memory_mb: Option<u64>,
    pub lazy: LazyConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            mode: StrategyMode::Predump,
            predump_iterations: 8,
            predump_interval_secs: 10,
            sync_after_predump: false,
            wait_before_dump_secs: 0,
            target_memory_mb: None,
            lazy: LazyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DirtyTrackingConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub max_duration_secs: u64,
}

impl Default for DirtyTrackingConfig {
    fn default() -> Self {
        DirtyTrackingConfig {
            enabled: false,
            interval_ms: 100,
            max_duration_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub workload_type: WorkloadKind,
    pub source: String,
    pub dest: String,
    pub ssh_user: String,
    pub working_dir: String,
    pub ready_file: String,
    pub strategy: StrategyConfig,
    pub transfer: TransferConfig,
    pub s3: Option<S3Config>,
    pub dirty_tracking: DirtyTrackingConfig,
    pub timeouts: Timeouts,
    pub workload: WorkloadSettings,
}

pub struct Experiment {
    config: ExperimentConfig,
    checkpoint: CheckpointManager,
    transfer: TransferManager,
    pub metrics: MetricsCollector,
    tracker: Option<DirtyTracker>,
    workload_pid: Option<u32>,
    iteration: usize,
    final_checkpoint_dir: Option<String>,
}

impl Experiment {
    pub fn new(config: ExperimentConfig) -> Result<Self, failure::Error> {
        if config.strategy.lazy.requires_s3() {
            match &config.s3 {
                Some(s3) => {
                    let errors = s3.validate();
                    if !errors.is_empty() {
                        failure::bail!(
                            "lazy mode {} needs a usable object storage config: {}",
                            config.strategy.lazy.mode.as_str(),
                            errors.join("; ")
                        );
                    }
                }
                None => failure::bail!(
                    "lazy mode {} requires an object storage configuration",
                    config.strategy.lazy.mode.as_str()
                ),
            }
        }

        let checkpoint = CheckpointManager::new(
            &config.ssh_user,
            &config.working_dir,
            config.timeouts.clone(),
        );
        let transfer = TransferManager::new(config.transfer.clone(), config.s3.clone());

        let mut metrics = MetricsCollector::new(&config.name, config.workload_type.as_str());
        metrics.set_nodes(&config.source, &config.dest);
        metrics.set_config(serde_json::to_value(&config)?);

        Ok(Experiment {
            config,
            checkpoint,
            transfer,
            metrics,
            tracker: None,
            workload_pid: None,
            iteration: 0,
            final_checkpoint_dir: None,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn checkpoint_mgr(&mut self) -> &mut CheckpointManager {
        &mut self.checkpoint
    }

    /// Run the whole pipeline. On error the tracker is stopped and the
    /// failure is recorded in the metrics; the caller still owns log
    /// collection, artifact writing, and process cleanup.
    pub fn run(&mut self, workload: &dyn Workload) -> Result<(), failure::Error> {
        let result = self.run_inner(workload);

        self.stop_tracking();

        if let Err(err) = &result {
            self.metrics.record_failure(&err.to_string());
        }

        result
    }

    fn run_inner(&mut self, workload: &dyn Workload) -> Result<(), failure::Error> {
        let source = self.config.source.clone();
        let dest = self.config.dest.clone();

        info!(
            "starting experiment {} ({} workload, {} -> {})",
            self.config.name,
            self.config.workload_type.as_str(),
            source,
            dest
        );

        self.checkpoint.prepare(&source)?;
        self.checkpoint.prepare(&dest)?;

        let command = workload.command(&self.config.working_dir);
        let pid = self.checkpoint.start_workload(&source, &command)?;
        self.workload_pid = Some(pid);

        let ready_file = self.config.ready_file.clone();
        self.checkpoint.wait_for_ready(&source, &ready_file)?;

        if self.config.dirty_tracking.enabled {
            self.start_tracking();
        }

        match self.config.strategy.mode {
            StrategyMode::Predump => self.run_predump_strategy()?,
            StrategyMode::Full => self.run_full_strategy()?,
        }

        // Tracking stops before any data leaves the source host.
        self.stop_tracking();

        self.transfer_checkpoint()?;
        self.restore_phase()?;

        self.metrics.finalize();
        Ok(())
    }

    fn start_tracking(&mut self) {
        let pid = match self.workload_pid {
            Some(pid) => pid,
            None => {
                warn!("cannot start dirty tracking without a workload pid");
                return;
            }
        };

        let cfg = self.config.dirty_tracking.clone();
        info!("starting dirty page tracking (every {}ms)", cfg.interval_ms);

        let mut tracker = DirtyTracker::new(&self.config.source);
        let started = tracker.start(
            self.checkpoint.pool_mut(),
            pid,
            cfg.interval_ms,
            self.config.workload_type.as_str(),
            cfg.max_duration_secs,
        );

        if started {
            if let Some(backend) = tracker.backend() {
                info!("dirty tracking running with the {:?} backend", backend);
            }
            self.tracker = Some(tracker);
        } else {
            warn!("dirty tracking unavailable, continuing without it");
        }
    }

    fn stop_tracking(&mut self) {
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.stop(self.checkpoint.pool_mut());
        }
    }

    /// Fetch the tracker's output to `local`, if tracking ran.
    pub fn collect_dirty_pattern(&mut self, local: &Path) -> bool {
        match self.tracker.as_ref() {
            Some(tracker) => {
                let pool = self.checkpoint.pool_mut();
                tracker.collect_results(pool, local)
            }
            None => false,
        }
    }

    fn run_predump_strategy(&mut self) -> Result<(), failure::Error> {
        let iterations = self.config.strategy.predump_iterations;
        let interval = Duration::from_secs(self.config.strategy.predump_interval_secs);
        let kind = self.config.workload_type;
        let source = self.config.source.clone();
        let pid = self.require_pid()?;

        info!(
            "running {} pre-dump iterations at a {}s floor",
            iterations,
            interval.as_secs()
        );

        for i in 1..=iterations {
            let iteration_start = Instant::now();
            let timer = format!("pre_dump_{}", i);
            self.metrics.start_timer(&timer);

            let record = match self.checkpoint.pre_dump(&source, pid, i, kind) {
                Ok(record) => record,
                Err(err) => {
                    self.record_failed_phase(&timer, &err, |m, metric| m.record_pre_dump(metric));
                    return Err(err);
                }
            };

            let mut sync_secs = 0.0;
            if self.config.strategy.sync_after_predump {
                let sync_start = Instant::now();
                self.transfer.sync_to_medium(
                    self.checkpoint.pool_mut(),
                    &source,
                    &record.checkpoint_dir,
                )?;
                sync_secs = sync_start.elapsed().as_secs_f64();
            }

            let mut meta = value_map(&record);
            meta.insert("success".into(), Value::from(true));
            meta.insert("rsync_duration".into(), Value::from(sync_secs));
            let metric = self.metrics.stop_timer(&timer, Some(meta))?;
            self.metrics.record_pre_dump(metric);

            self.iteration = i;

            // Keep the pacing floor even when a pre-dump finishes early.
            let elapsed = iteration_start.elapsed();
            if elapsed < interval && i < iterations {
                std::thread::sleep(interval - elapsed);
            }
        }

        self.run_final_dump()
    }

    fn run_full_strategy(&mut self) -> Result<(), failure::Error> {
        let target = self.config.strategy.target_memory_mb;
        let wait_secs = self.config.strategy.wait_before_dump_secs;

        if let Some(target_mb) = target {
            info!("waiting for the workload to reach {} MB", target_mb);
            if !self.wait_for_target_memory(target_mb)? {
                warn!(
                    "target memory not reached within {}s, dumping anyway",
                    self.config.timeouts.target_memory_secs
                );
            }
        } else if wait_secs > 0 {
            info!("waiting {}s before the dump", wait_secs);
            std::thread::sleep(Duration::from_secs(wait_secs));
        }

        self.run_final_dump()
    }

    fn wait_for_target_memory(&mut self, target_mb: u64) -> Result<bool, failure::Error> {
        let pid = self.require_pid()?;
        let source = self.config.source.clone();
        let timeout = Duration::from_secs(self.config.timeouts.target_memory_secs);
        let probe = format!("grep VmRSS /proc/{}/status | awk '{{print $2}}'", pid);
        let start = Instant::now();

        while start.elapsed() < timeout {
            let out = self.checkpoint.pool_mut().exec(&source, &probe, Some(10))?;
            if out.ok() {
                if let Ok(kb) = out.stdout.trim().parse::<u64>() {
                    info!("[memory] {:.1} MB / {} MB", kb as f64 / 1024.0, target_mb);
                }
                if memory_target_reached(&out.stdout, target_mb) {
                    return Ok(true);
                }
            }
            std::thread::sleep(Duration::from_secs(2));
        }

        Ok(false)
    }

    fn run_final_dump(&mut self) -> Result<(), failure::Error> {
        let lazy = self.config.strategy.lazy.clone();
        let kind = self.config.workload_type;
        let source = self.config.source.clone();
        let pid = self.require_pid()?;

        // Snapshot the workload's output and memory before it is frozen.
        self.checkpoint.capture_workload_log(&source, pid, "pre_dump", 5);

        self.metrics.start_timer("final_dump");

        let record = match self
            .checkpoint
            .final_dump(&source, pid, self.iteration, &lazy, kind)
        {
            Ok(record) => record,
            Err(err) => {
                self.record_failed_phase("final_dump", &err, |m, metric| {
                    m.record_final_dump(metric)
                });
                return Err(err);
            }
        };

        let mut sync_secs = 0.0;
        let method = self.transfer.method();
        if method == TransferMethod::Ebs || method == TransferMethod::Efs {
            let sync_start = Instant::now();
            self.transfer.sync_to_medium(
                self.checkpoint.pool_mut(),
                &source,
                &record.checkpoint_dir,
            )?;
            sync_secs = sync_start.elapsed().as_secs_f64();
        }

        let mut meta = value_map(&record);
        meta.insert("success".into(), Value::from(true));
        meta.insert("lazy_config".into(), serde_json::to_value(&lazy)?);
        meta.insert("rsync_duration".into(), Value::from(sync_secs));
        let metric = self.metrics.stop_timer("final_dump", Some(meta))?;
        self.metrics.record_final_dump(metric);

        self.iteration = record.iteration;
        self.final_checkpoint_dir = Some(record.checkpoint_dir);
        Ok(())
    }

    fn transfer_checkpoint(&mut self) -> Result<(), failure::Error> {
        let checkpoint_dir = self
            .final_checkpoint_dir
            .clone()
            .ok_or_else(|| failure::format_err!("no final checkpoint to transfer"))?;
        let source = self.config.source.clone();
        let dest = self.config.dest.clone();
        let lazy = self.config.strategy.lazy.clone();
        let method = self.transfer.method();

        info!("transferring {} via {}", checkpoint_dir, method.as_str());
        self.metrics.start_timer("transfer");

        let result = match self.transfer.transfer(
            self.checkpoint.pool_mut(),
            &source,
            &dest,
            &checkpoint_dir,
            &lazy,
        ) {
            Ok(result) => result,
            Err(err) => {
                self.record_failed_phase("transfer", &err, |m, metric| {
                    m.record_transfer(metric, method.as_str())
                });
                return Err(err);
            }
        };

        let mut meta = value_map(&result);
        meta.insert("success".into(), Value::from(true));
        let metric = self.metrics.stop_timer("transfer", Some(meta))?;
        self.metrics.record_transfer(metric, method.as_str());
        Ok(())
    }

    /// Directory the restore reads on the destination, per transfer
    /// method.
    fn dest_checkpoint_dir(&self) -> String {
        match self.transfer.method() {
            TransferMethod::Efs => self
                .final_checkpoint_dir
                .clone()
                .unwrap_or_else(|| self.checkpoint_dir_for(self.iteration)),
            TransferMethod::Ebs => {
                format!("{}/{}", self.config.transfer.ebs_mount, self.iteration)
            }
            _ => self.checkpoint_dir_for(self.iteration),
        }
    }

    fn checkpoint_dir_for(&self, iteration: usize) -> String {
        format!("{}/{}", self.config.working_dir, iteration)
    }

    fn restore_phase(&mut self) -> Result<(), failure::Error> {
        let lazy = self.config.strategy.lazy.clone();
        let kind = self.config.workload_type;
        let source = self.config.source.clone();
        let dest = self.config.dest.clone();
        let dest_dir = self.dest_checkpoint_dir();
        let redis_port = self.config.workload.redis_port;

        let page_server_host = if lazy.requires_page_server() {
            Some(source.as_str())
        } else {
            None
        };

        info!(
            "restoring from {} on {} (mode {})",
            dest_dir,
            dest,
            lazy.mode.as_str()
        );
        self.metrics.start_timer("restore");

        let use_s3_restore = lazy.requires_s3() && self.transfer.method() == TransferMethod::S3;
        let result = if use_s3_restore {
            let s3 = self
                .config
                .s3
                .clone()
                .ok_or_else(|| failure::format_err!("object storage restore without s3 config"))?;
            self.checkpoint
                .restore_with_s3(&dest, &dest_dir, &s3, &lazy, page_server_host, kind)
        } else {
            self.checkpoint
                .restore(&dest, &dest_dir, &lazy, page_server_host, kind)
        };

        let record = match result {
            Ok(record) => record,
            Err(err) => {
                self.record_failed_phase("restore", &err, |m, metric| m.record_restore(metric));
                return Err(err);
            }
        };

        // Everything from here on is observational.
        let verify = self.checkpoint.verify_restore(&dest, &dest_dir, None, 30);
        if !verify.verified {
            warn!("restored process exited early; capturing a post-restore snapshot");
        }
        if let Some(pid) = verify.pid {
            self.checkpoint
                .capture_workload_log(&dest, pid, "post_restore", 3);
        }

        let health = self.checkpoint.verify_workload_health(&dest, kind, redis_port);
        if !health.healthy {
            warn!(
                "workload health check failed: {}",
                health.error.as_deref().unwrap_or("unknown")
            );
        }

        let mut meta = value_map(&record);
        meta.insert("success".into(), Value::from(true));
        meta.insert("lazy_config".into(), serde_json::to_value(&lazy)?);
        meta.insert("process_running".into(), Value::from(verify.verified));
        meta.insert("verification".into(), serde_json::to_value(&verify)?);
        meta.insert("health".into(), serde_json::to_value(&health)?);
        let metric = self.metrics.stop_timer("restore", Some(meta))?;
        self.metrics.record_restore(metric);

        if lazy.requires_lazy_pages() {
            self.metrics.start_timer("lazy_pages_completion");
            let lp = self.checkpoint.wait_for_lazy_pages_complete(&dest);
            let mut meta = value_map(&lp);
            meta.insert("completed".into(), Value::from(lp.completed));
            let metric = self.metrics.stop_timer("lazy_pages_completion", Some(meta))?;
            self.metrics.record_lazy_pages_completion(metric);
        }

        Ok(())
    }

    fn require_pid(&self) -> Result<u32, failure::Error> {
        self.workload_pid
            .ok_or_else(|| failure::format_err!("workload pid not known yet"))
    }

    fn record_failed_phase<F>(&mut self, timer: &str, err: &failure::Error, record: F)
    where
        F: FnOnce(&mut MetricsCollector, crate::telemetry::PhaseMetric),
    {
        let mut meta = Map::new();
        meta.insert("success".into(), Value::from(false));
        meta.insert("error".into(), Value::from(err.to_string()));
        if let Ok(metric) = self.metrics.stop_timer(timer, Some(meta)) {
            record(&mut self.metrics, metric);
        }
    }
}

/// Has the workload's resident set reached the requested size? The input
/// is the `VmRSS` value from `/proc/{pid}/status`, in kB.
pub fn memory_target_reached(vmrss_kb: &str, target_mb: u64) -> bool {
    match vmrss_kb.trim().parse::<u64>() {
        Ok(kb) => kb >= target_mb * 1024,
        Err(_) => false,
    }
}

fn value_map<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_gate_trips_exactly_at_the_target() {
        // Increasing VmRSS readings for a 1024 MB target.
        let readings = ["102400", "524288", "1048575", "1048576", "2097152"];
        let results: Vec<bool> = readings
            .iter()
            .map(|r| memory_target_reached(r, 1024))
            .collect();
        assert_eq!(results, vec![false, false, false, true, true]);
    }

    #[test]
    fn memory_gate_ignores_garbage() {
        assert!(!memory_target_reached("", 1024));
        assert!(!memory_target_reached("not-a-number", 1024));
        assert!(memory_target_reached(" 1048576 \n", 1024));
    }

    #[test]
    fn strategy_defaults() {
        let strategy = StrategyConfig::default();
        assert_eq!(strategy.mode, StrategyMode::Predump);
        assert_eq!(strategy.predump_iterations, 8);
        assert_eq!(strategy.predump_interval_secs, 10);
        assert!(strategy.target_memory_mb.is_none());
    }

    #[test]
    fn prefetch_modes_insist_on_object_storage() {
        use crate::lazy::{LazyConfig, LazyMode};

        let mut config = ExperimentConfig {
            name: "t".into(),
            workload_type: WorkloadKind::Memory,
            source: "10.0.0.1".into(),
            dest: "10.0.0.2".into(),
            ssh_user: "ubuntu".into(),
            working_dir: "/tmp/criu_checkpoint".into(),
            ready_file: "checkpoint_ready".into(),
            strategy: StrategyConfig {
                lazy: LazyConfig::new(LazyMode::LazyPrefetch),
                ..Default::default()
            },
            transfer: TransferConfig::default(),
            s3: None,
            dirty_tracking: DirtyTrackingConfig::default(),
            timeouts: Timeouts::default(),
            workload: WorkloadSettings::default(),
        };

        assert!(Experiment::new(config.clone()).is_err());

        config.strategy.lazy = LazyConfig::new(LazyMode::None);
        assert!(Experiment::new(config).is_ok());
    }
}
