//! The `migrate` subcommand: map the CLI surface onto an experiment
//! configuration, drive the run, and handle the artifacts afterwards
//! (metrics document, collected logs, parsed CRIU events, dirty-page
//! pattern, process cleanup).

use std::path::{Path, PathBuf};

use clap::clap_app;
use log::{info, warn};
use serde_json::{Map, Value};

use crate::checkpoint::Timeouts;
use crate::experiment::{
    DirtyTrackingConfig, Experiment, ExperimentConfig, StrategyConfig, StrategyMode,
};
use crate::lazy::{LazyConfig, LazyMode};
use crate::logparse::LogParser;
use crate::objstore::{S3Config, S3Kind};
use crate::transfer::{TransferConfig, TransferMethod};
use crate::workloads::{self, WorkloadKind, WorkloadSettings};

pub fn cli_options() -> clap::App<'static, 'static> {
    fn is_usize(s: String) -> Result<(), String> {
        s.parse::<usize>().map(|_| ()).map_err(|e| format!("{:?}", e))
    }
    fn is_u64(s: String) -> Result<(), String> {
        s.parse::<u64>().map(|_| ()).map_err(|e| format!("{:?}", e))
    }
    fn is_u32(s: String) -> Result<(), String> {
        s.parse::<u32>().map(|_| ()).map_err(|e| format!("{:?}", e))
    }
    fn is_u16(s: String) -> Result<(), String> {
        s.parse::<u16>().map(|_| ()).map_err(|e| format!("{:?}", e))
    }
    fn is_f64(s: String) -> Result<(), String> {
        s.parse::<f64>().map(|_| ()).map_err(|e| format!("{:?}", e))
    }

    clap_app! { migrate =>
        (about: "Run a checkpoint/migration experiment across two hosts. \
                 Requires passwordless sudo and criu on both.")

        (@arg SOURCE: --("source-ip") +takes_value
         "Source node address (falls back to $SOURCE_NODE_IP)")
        (@arg DEST: --("dest-ip") +takes_value
         "Destination node address (falls back to $DEST_NODE_IP)")
        (@arg SSH_USER: --("ssh-user") +takes_value
         "SSH username on both nodes (default: ubuntu)")
        (@arg WORKING_DIR: --("working-dir") +takes_value
         "Checkpoint working directory on both nodes (default: /tmp/criu_checkpoint)")
        (@arg NAME: -n --name +takes_value
         "Experiment name, used for the artifact directory")

        (@arg WORKLOAD: -w --workload +takes_value
         "Workload to run: memory, matmul, redis, video (default: memory)")
        (@arg MB_SIZE: --("mb-size") +takes_value {is_usize}
         "Memory block size in MB (memory workload)")
        (@arg MAX_MEMORY: --("max-memory") +takes_value {is_usize}
         "Memory cap in MB (memory workload)")
        (@arg INTERVAL: --interval +takes_value {is_f64}
         "Seconds between allocations (memory workload)")
        (@arg MATRIX_SIZE: --("matrix-size") +takes_value {is_usize}
         "Matrix dimension (matmul workload)")
        (@arg ITERATIONS: --iterations +takes_value {is_usize}
         "Iteration count, 0 = until stopped (matmul workload)")
        (@arg REDIS_PORT: --("redis-port") +takes_value {is_u16}
         "Redis server port (redis workload)")
        (@arg NUM_KEYS: --("num-keys") +takes_value {is_usize}
         "Number of keys to load (redis workload)")
        (@arg VALUE_SIZE: --("value-size") +takes_value {is_usize}
         "Value size in bytes (redis workload)")
        (@arg RESOLUTION: --resolution +takes_value
         "Resolution WxH (video workload)")
        (@arg FPS: --fps +takes_value {is_u32}
         "Frames per second (video workload)")
        (@arg DURATION: --duration +takes_value {is_u64}
         "Encode duration in seconds (video workload)")
        (@arg VIDEO_MODE: --("video-mode") +takes_value
         "Video output: live or file (video workload)")

        (@arg STRATEGY: --strategy +takes_value
         "Checkpoint strategy: predump or full (default: predump)")
        (@arg PREDUMP_ITERATIONS: --("predump-iterations") +takes_value {is_usize}
         "Number of pre-dump iterations (default: 8)")
        (@arg PREDUMP_INTERVAL: --("predump-interval") +takes_value {is_u64}
         "Pacing floor between pre-dumps in seconds (default: 10)")
        (@arg SYNC_AFTER_PREDUMP: --("sync-after-predump")
         "Sync each pre-dump onto the transfer medium (ebs)")
        (@arg WAIT_BEFORE_DUMP: --("wait-before-dump") +takes_value {is_u64}
         conflicts_with[TARGET_MEMORY_MB]
         "Seconds to wait before a full dump (time trigger)")
        (@arg TARGET_MEMORY_MB: --("target-memory-mb") +takes_value {is_u64}
         "Dump once VmRSS reaches this many MB (memory trigger)")

        (@arg LAZY_MODE: --("lazy-mode") +takes_value
         "Restore mode: none, lazy, lazy-prefetch, live-migration, \
          live-migration-prefetch (default: none)")
        (@arg PAGE_SERVER_PORT: --("page-server-port") +takes_value {is_u16}
         "Page-server port for live migration (default: 27)")
        (@arg PREFETCH_WORKERS: --("prefetch-workers") +takes_value {is_usize}
         "Prefetch worker pool size (default: 4)")

        (@arg TRANSFER_METHOD: --("transfer-method") +takes_value
         "Transfer method: rsync, s3, efs, ebs (default: rsync)")
        (@arg DEST_DIR: --("dest-dir") +takes_value
         "Destination directory for rsync (default: the working directory)")
        (@arg EFS_MOUNT: --("efs-mount") +takes_value
         "EFS mount point (default: /mnt/efs)")
        (@arg EBS_MOUNT: --("ebs-mount") +takes_value
         "EBS mount point (default: /mnt/ebs_test)")

        (@arg S3_TYPE: --("s3-type") +takes_value
         "S3 storage type: standard, cloudfront, express-one-zone")
        (@arg S3_UPLOAD_BUCKET: --("s3-upload-bucket") +takes_value
         "Bucket checkpoints are uploaded to")
        (@arg S3_PREFIX: --("s3-prefix") +takes_value
         "Object prefix, e.g. checkpoints/exp1")
        (@arg S3_REGION: --("s3-region") +takes_value
         "AWS region (falls back to $REGION)")
        (@arg S3_DOWNLOAD_ENDPOINT: --("s3-download-endpoint") +takes_value
         "Endpoint CRIU fetches pages from")
        (@arg S3_DOWNLOAD_BUCKET: --("s3-download-bucket") +takes_value
         "Bucket for CRIU fetches (default: the upload bucket)")
        (@arg S3_ACCESS_KEY: --("s3-access-key") +takes_value
         "Access key (express-one-zone)")
        (@arg S3_SECRET_KEY: --("s3-secret-key") +takes_value
         "Secret key (express-one-zone)")
        (@arg S3_PURGE: --("s3-purge")
         "Delete previous checkpoint objects before uploading")

        (@arg READY_FILE: --("ready-file") +takes_value
         "Readiness file the workload creates (default: checkpoint_ready)")
        (@arg READY_TIMEOUT: --("ready-timeout") +takes_value {is_u64}
         "Seconds to wait for workload readiness (default: 300)")
        (@arg PRE_DUMP_TIMEOUT: --("pre-dump-timeout") +takes_value {is_u64}
         "Per-pre-dump timeout in seconds (default: 120)")
        (@arg DUMP_TIMEOUT: --("dump-timeout") +takes_value {is_u64}
         "Final dump timeout in seconds (default: 300)")
        (@arg RESTORE_TIMEOUT: --("restore-timeout") +takes_value {is_u64}
         "Restore timeout in seconds (default: 300)")
        (@arg MEMORY_TIMEOUT: --("memory-timeout") +takes_value {is_u64}
         "Memory-trigger timeout in seconds (default: 600)")
        (@arg LAZY_PAGES_TIMEOUT: --("lazy-pages-timeout") +takes_value {is_u64}
         "Lazy-pages completion timeout in seconds (default: 300)")
        (@arg QUIESCENCE_TIMEOUT: --("quiescence-timeout") +takes_value {is_u64}
         "Backgrounded dump quiescence timeout in seconds (default: 300)")

        (@arg OUTPUT: -o --output +takes_value
         "Metrics JSON path (default: metrics.json, or inside the log directory)")
        (@arg COLLECT_LOGS: --("collect-logs")
         "Fetch CRIU and workload logs from both nodes after the run")
        (@arg LOGS_DIR: --("logs-dir") +takes_value
         "Directory collected artifacts go under (default: ./results)")

        (@arg TRACK_DIRTY_PAGES: --("track-dirty-pages")
         "Sample the workload's dirty pages during the run")
        (@arg DIRTY_TRACK_INTERVAL: --("dirty-track-interval") +takes_value {is_u64}
         "Dirty sampling interval in ms (default: 100)")
        (@arg DIRTY_TRACK_DURATION: --("dirty-track-duration") +takes_value {is_u64}
         "Maximum tracking duration in seconds (default: 3600)")

        (@arg NO_CLEANUP: --("no-cleanup")
         "Leave the restored process running after the run")
    }
}

fn arg_or_env(sub_m: &clap::ArgMatches<'_>, arg: &str, env: &str) -> Option<String> {
    sub_m
        .value_of(arg)
        .map(str::to_owned)
        .or_else(|| std::env::var(env).ok().filter(|v| !v.is_empty()))
}

fn parsed<T: std::str::FromStr>(sub_m: &clap::ArgMatches<'_>, arg: &str, default: T) -> T {
    sub_m
        .value_of(arg)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn build_config(sub_m: &clap::ArgMatches<'_>) -> Result<ExperimentConfig, failure::Error> {
    let source = arg_or_env(sub_m, "SOURCE", "SOURCE_NODE_IP")
        .ok_or_else(|| failure::format_err!("no source node: pass --source-ip or set SOURCE_NODE_IP"))?;
    let dest = arg_or_env(sub_m, "DEST", "DEST_NODE_IP")
        .ok_or_else(|| failure::format_err!("no destination node: pass --dest-ip or set DEST_NODE_IP"))?;

    let workload_type = WorkloadKind::from_cli(sub_m.value_of("WORKLOAD").unwrap_or("memory"))
        .map_err(|e| failure::format_err!("{}", e))?;

    let working_dir = sub_m
        .value_of("WORKING_DIR")
        .unwrap_or("/tmp/criu_checkpoint")
        .to_owned();

    let defaults = WorkloadSettings::default();
    let workload = WorkloadSettings {
        mb_size: parsed(sub_m, "MB_SIZE", defaults.mb_size),
        max_memory_mb: parsed(sub_m, "MAX_MEMORY", defaults.max_memory_mb),
        interval_secs: parsed(sub_m, "INTERVAL", defaults.interval_secs),
        matrix_size: parsed(sub_m, "MATRIX_SIZE", defaults.matrix_size),
        iterations: parsed(sub_m, "ITERATIONS", defaults.iterations),
        redis_port: parsed(sub_m, "REDIS_PORT", defaults.redis_port),
        num_keys: parsed(sub_m, "NUM_KEYS", defaults.num_keys),
        value_size: parsed(sub_m, "VALUE_SIZE", defaults.value_size),
        resolution: sub_m
            .value_of("RESOLUTION")
            .map(str::to_owned)
            .unwrap_or_else(|| defaults.resolution.clone()),
        fps: parsed(sub_m, "FPS", defaults.fps),
        duration_secs: parsed(sub_m, "DURATION", defaults.duration_secs),
        video_mode: sub_m
            .value_of("VIDEO_MODE")
            .map(str::to_owned)
            .unwrap_or_else(|| defaults.video_mode.clone()),
    };

    let lazy = LazyConfig {
        mode: LazyMode::from_cli(sub_m.value_of("LAZY_MODE").unwrap_or("none"))
            .map_err(|e| failure::format_err!("{}", e))?,
        page_server_port: parsed(sub_m, "PAGE_SERVER_PORT", 27),
        page_server_address: "0.0.0.0".into(),
        prefetch_workers: parsed(sub_m, "PREFETCH_WORKERS", 4),
    };

    let strategy_defaults = StrategyConfig::default();
    let strategy = StrategyConfig {
        mode: StrategyMode::from_cli(sub_m.value_of("STRATEGY").unwrap_or("predump"))
            .map_err(|e| failure::format_err!("{}", e))?,
        predump_iterations: parsed(sub_m, "PREDUMP_ITERATIONS", strategy_defaults.predump_iterations),
        predump_interval_secs: parsed(sub_m, "PREDUMP_INTERVAL", strategy_defaults.predump_interval_secs),
        sync_after_predump: sub_m.is_present("SYNC_AFTER_PREDUMP"),
        wait_before_dump_secs: parsed(sub_m, "WAIT_BEFORE_DUMP", 0),
        target_memory_mb: sub_m
            .value_of("TARGET_MEMORY_MB")
            .and_then(|v| v.parse::<u64>().ok()),
        lazy,
    };

    let method = TransferMethod::from_cli(sub_m.value_of("TRANSFER_METHOD").unwrap_or("rsync"))
        .map_err(|e| failure::format_err!("{}", e))?;
    let transfer_defaults = TransferConfig::default();
    let transfer = TransferConfig {
        method,
        dest_dir: sub_m
            .value_of("DEST_DIR")
            .map(str::to_owned)
            .unwrap_or_else(|| working_dir.clone()),
        efs_mount: sub_m
            .value_of("EFS_MOUNT")
            .map(str::to_owned)
            .unwrap_or_else(|| transfer_defaults.efs_mount.clone()),
        ebs_mount: sub_m
            .value_of("EBS_MOUNT")
            .map(str::to_owned)
            .unwrap_or_else(|| transfer_defaults.ebs_mount.clone()),
        purge_before_upload: sub_m.is_present("S3_PURGE"),
    };

    let s3 = match sub_m.value_of("S3_UPLOAD_BUCKET") {
        Some(bucket) => {
            let kind = S3Kind::from_cli(sub_m.value_of("S3_TYPE").unwrap_or("standard"))
                .map_err(|e| failure::format_err!("{}", e))?;
            let mut s3 = S3Config::new(kind, bucket, sub_m.value_of("S3_PREFIX").unwrap_or(""));
            s3.upload_region = arg_or_env(sub_m, "S3_REGION", "REGION").unwrap_or_default();
            s3.download_endpoint = sub_m
                .value_of("S3_DOWNLOAD_ENDPOINT")
                .unwrap_or("")
                .to_owned();
            if let Some(bucket) = sub_m.value_of("S3_DOWNLOAD_BUCKET") {
                s3.download_bucket = bucket.to_owned();
            }
            s3.access_key = sub_m.value_of("S3_ACCESS_KEY").unwrap_or("").to_owned();
            s3.secret_key = sub_m.value_of("S3_SECRET_KEY").unwrap_or("").to_owned();
            Some(s3)
        }
        None => None,
    };

    let timeout_defaults = Timeouts::default();
    let timeouts = Timeouts {
        ready_secs: parsed(sub_m, "READY_TIMEOUT", timeout_defaults.ready_secs),
        pre_dump_secs: parsed(sub_m, "PRE_DUMP_TIMEOUT", timeout_defaults.pre_dump_secs),
        final_dump_secs: parsed(sub_m, "DUMP_TIMEOUT", timeout_defaults.final_dump_secs),
        restore_secs: parsed(sub_m, "RESTORE_TIMEOUT", timeout_defaults.restore_secs),
        target_memory_secs: parsed(sub_m, "MEMORY_TIMEOUT", timeout_defaults.target_memory_secs),
        lazy_pages_secs: parsed(sub_m, "LAZY_PAGES_TIMEOUT", timeout_defaults.lazy_pages_secs),
        quiescence_secs: parsed(sub_m, "QUIESCENCE_TIMEOUT", timeout_defaults.quiescence_secs),
    };

    let dirty_defaults = DirtyTrackingConfig::default();
    let dirty_tracking = DirtyTrackingConfig {
        enabled: sub_m.is_present("TRACK_DIRTY_PAGES"),
        interval_ms: parsed(sub_m, "DIRTY_TRACK_INTERVAL", dirty_defaults.interval_ms),
        max_duration_secs: parsed(sub_m, "DIRTY_TRACK_DURATION", dirty_defaults.max_duration_secs),
    };

    Ok(ExperimentConfig {
        name: sub_m.value_of("NAME").unwrap_or("baseline").to_owned(),
        workload_type,
        source,
        dest,
        ssh_user: sub_m.value_of("SSH_USER").unwrap_or("ubuntu").to_owned(),
        working_dir,
        ready_file: sub_m
            .value_of("READY_FILE")
            .unwrap_or(crate::common::CHECKPOINT_READY_FILE)
            .to_owned(),
        strategy,
        transfer,
        s3,
        dirty_tracking,
        timeouts,
        workload,
    })
}

fn cli_args_map(sub_m: &clap::ArgMatches<'_>) -> Map<String, Value> {
    const VALUE_ARGS: [&str; 38] = [
        "SOURCE", "DEST", "SSH_USER", "WORKING_DIR", "NAME", "WORKLOAD", "MB_SIZE",
        "MAX_MEMORY", "INTERVAL", "MATRIX_SIZE", "ITERATIONS", "REDIS_PORT", "NUM_KEYS",
        "VALUE_SIZE", "RESOLUTION", "FPS", "DURATION", "VIDEO_MODE", "STRATEGY",
        "PREDUMP_ITERATIONS", "PREDUMP_INTERVAL", "WAIT_BEFORE_DUMP", "TARGET_MEMORY_MB",
        "LAZY_MODE", "PAGE_SERVER_PORT", "PREFETCH_WORKERS", "TRANSFER_METHOD", "DEST_DIR",
        "S3_TYPE", "S3_UPLOAD_BUCKET", "S3_PREFIX", "S3_REGION", "S3_DOWNLOAD_ENDPOINT",
        "OUTPUT", "LOGS_DIR", "READY_FILE", "DIRTY_TRACK_INTERVAL", "DIRTY_TRACK_DURATION",
    ];
    const FLAG_ARGS: [&str; 5] = [
        "SYNC_AFTER_PREDUMP", "S3_PURGE", "COLLECT_LOGS", "TRACK_DIRTY_PAGES", "NO_CLEANUP",
    ];

    let mut map = Map::new();
    for arg in &VALUE_ARGS {
        if let Some(value) = sub_m.value_of(arg) {
            map.insert(arg.to_lowercase(), Value::from(value));
        }
    }
    for arg in &FLAG_ARGS {
        if sub_m.is_present(arg) {
            map.insert(arg.to_lowercase(), Value::from(true));
        }
    }
    map
}

/// Parse the collected CRIU logs into one structured event file next to
/// the metrics document. Best-effort.
fn export_criu_events(log_files: &crate::telemetry::LogFiles) {
    let parser = LogParser::new();
    let mut events = Vec::new();

    for file in log_files.source.iter().chain(log_files.dest.iter()) {
        match parser.parse_file(Path::new(file)) {
            Ok(mut parsed) => events.append(&mut parsed),
            Err(err) => warn!("could not parse {}: {}", file, err),
        }
    }

    if events.is_empty() {
        return;
    }

    events.sort_by(|a, b| {
        a.timestamp_sec
            .partial_cmp(&b.timestamp_sec)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let out = Path::new(&log_files.output_dir).join("criu_events.json");
    match serde_json::to_string_pretty(&events) {
        Ok(json) => {
            if let Err(err) = std::fs::write(&out, json) {
                warn!("could not write {}: {}", out.display(), err);
            } else {
                info!("parsed {} criu events into {}", events.len(), out.display());
            }
        }
        Err(err) => warn!("could not serialize criu events: {}", err),
    }
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let config = build_config(sub_m)?;

    let workload = workloads::create(config.workload_type, &config.workload);
    workload.validate_config()?;

    let collect_logs = sub_m.is_present("COLLECT_LOGS");
    let logs_dir = sub_m.value_of("LOGS_DIR").unwrap_or("./results").to_owned();
    let name = sub_m.value_of("NAME").map(str::to_owned);
    let no_cleanup = sub_m.is_present("NO_CLEANUP");
    let output = sub_m.value_of("OUTPUT").map(str::to_owned);
    let track_dirty = sub_m.is_present("TRACK_DIRTY_PAGES");

    let mut experiment = Experiment::new(config)?;
    experiment.metrics.set_cli_args(cli_args_map(sub_m));

    let source = experiment.config().source.clone();
    let dest = experiment.config().dest.clone();
    let working_dir = experiment.config().working_dir.clone();
    let kind = experiment.config().workload_type;

    // Both hosts get the script: the source runs it, the destination
    // needs its interpreter and dependencies for the restored tree. A
    // deploy failure still falls through to log collection and the
    // metrics write below.
    experiment.metrics.start_timer("workload_deploy");
    let mut deploy_result = Ok(());
    for host in &[source.as_str(), dest.as_str()] {
        info!("deploying {} workload to {}", kind.as_str(), host);
        if let Err(err) = workloads::deploy(
            workload.as_ref(),
            experiment.checkpoint_mgr().pool_mut(),
            host,
            &working_dir,
        ) {
            deploy_result = Err(err);
            break;
        }
    }

    let mut deploy_meta = Map::new();
    deploy_meta.insert("success".into(), Value::from(deploy_result.is_ok()));
    if let Err(err) = &deploy_result {
        deploy_meta.insert("error".into(), Value::from(err.to_string()));
    }
    if let Ok(metric) = experiment.metrics.stop_timer("workload_deploy", Some(deploy_meta)) {
        experiment.metrics.add_custom_metric(metric);
    }

    let run_result = match deploy_result {
        Ok(()) => experiment.run(workload.as_ref()),
        Err(err) => {
            experiment.metrics.record_failure(&err.to_string());
            Err(err)
        }
    };

    match &run_result {
        Ok(()) => experiment.metrics.print_summary(),
        Err(err) => log::error!("experiment failed: {}", err),
    }

    // Artifacts are collected on success and on failure alike; a failed
    // run with no logs cannot be diagnosed.
    let mut artifact_dir: Option<PathBuf> = None;
    if collect_logs {
        let collection_name = match (&run_result, name.as_deref()) {
            (Ok(()), Some(name)) => Some(name.to_owned()),
            (Ok(()), None) => None,
            (Err(_), Some(name)) => Some(format!("{}_failed", name)),
            (Err(_), None) => Some("failed".to_owned()),
        };

        let log_files = experiment.checkpoint_mgr().collect_logs(
            &source,
            &dest,
            &logs_dir,
            collection_name.as_deref(),
        );
        println!(
            "Logs collected: {} ({} source, {} dest)",
            log_files.output_dir,
            log_files.source.len(),
            log_files.dest.len()
        );
        artifact_dir = Some(PathBuf::from(&log_files.output_dir));
        export_criu_events(&log_files);
        experiment.metrics.set_log_files(log_files);
    }

    if track_dirty {
        let target_dir = match &artifact_dir {
            Some(dir) => dir.clone(),
            None => PathBuf::from(&logs_dir),
        };
        if let Err(err) = std::fs::create_dir_all(&target_dir) {
            warn!("could not create {}: {}", target_dir.display(), err);
        }
        let local = target_dir.join("dirty_pattern.json");
        if experiment.collect_dirty_pattern(&local) {
            println!("Dirty pattern collected: {}", local.display());
        } else {
            warn!("no dirty pattern collected from {}", source);
        }
    }

    let metrics_path = match (&output, &artifact_dir) {
        (Some(path), _) => PathBuf::from(path),
        (None, Some(dir)) => dir.join("metrics.json"),
        (None, None) => PathBuf::from("metrics.json"),
    };
    experiment.metrics.save_to_file(&metrics_path)?;
    info!("metrics saved to {}", metrics_path.display());

    if run_result.is_ok() && !no_cleanup {
        info!("cleaning up workload processes");
        experiment.checkpoint_mgr().cleanup_processes(&dest, kind);
        experiment.checkpoint_mgr().cleanup_processes(&source, kind);
    }

    experiment.checkpoint_mgr().close_all_connections();

    run_result
}
