//! Metrics collection for a migration run.
//!
//! Phases are time-boxed by name; the finished record is one JSON
//! document per run (`metrics.json`) whose field names are stable, plus a
//! human-readable summary on the console.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use console::style;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One timed phase. `end_time - start_time == duration` holds exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetric {
    pub name: String,
    pub duration: f64,
    pub start_time: f64,
    pub end_time: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Paths of the artifacts fetched after a run, split by originating host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogFiles {
    pub output_dir: String,
    pub source: Vec<String>,
    pub dest: Vec<String>,
}

/// The complete record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentMetrics {
    pub experiment_name: String,
    pub workload_type: String,
    pub timestamp: String,
    pub total_duration: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub pre_dump_iterations: Vec<PhaseMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_dump: Option<PhaseMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer: Option<PhaseMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore: Option<PhaseMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lazy_pages_completion: Option<PhaseMetric>,
    #[serde(default)]
    pub custom_metrics: BTreeMap<String, PhaseMetric>,

    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub cli_args: Map<String, Value>,
    #[serde(default)]
    pub nodes: BTreeMap<String, String>,
    #[serde(default)]
    pub log_files: LogFiles,
}

pub struct MetricsCollector {
    metrics: ExperimentMetrics,
    run_start: Instant,
    active: HashMap<String, (Instant, f64)>,
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl MetricsCollector {
    pub fn new(experiment_name: &str, workload_type: &str) -> Self {
        MetricsCollector {
            metrics: ExperimentMetrics {
                experiment_name: experiment_name.to_owned(),
                workload_type: workload_type.to_owned(),
                timestamp: chrono::Local::now().to_rfc3339(),
                total_duration: 0.0,
                success: true,
                error: None,
                pre_dump_iterations: Vec::new(),
                final_dump: None,
                transfer: None,
                restore: None,
                lazy_pages_completion: None,
                custom_metrics: BTreeMap::new(),
                config: Value::Null,
                cli_args: Map::new(),
                nodes: BTreeMap::new(),
                log_files: LogFiles::default(),
            },
            run_start: Instant::now(),
            active: HashMap::new(),
        }
    }

    pub fn set_config(&mut self, config: Value) {
        self.metrics.config = config;
    }

    pub fn set_cli_args(&mut self, args: Map<String, Value>) {
        self.metrics.cli_args = args;
    }

    pub fn set_nodes(&mut self, source: &str, dest: &str) {
        self.metrics.nodes.insert("source".into(), source.into());
        self.metrics
            .nodes
            .insert("destination".into(), dest.into());
    }

    pub fn set_log_files(&mut self, log_files: LogFiles) {
        self.metrics.log_files = log_files;
    }

    pub fn start_timer(&mut self, name: &str) {
        self.active
            .insert(name.to_owned(), (Instant::now(), epoch_now()));
    }

    /// Stop a named timer, producing its phase record.
    pub fn stop_timer(
        &mut self,
        name: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<PhaseMetric, failure::Error> {
        let (started, start_time) = self
            .active
            .remove(name)
            .ok_or_else(|| failure::format_err!("timer {:?} was never started", name))?;

        let duration = started.elapsed().as_secs_f64();

        Ok(PhaseMetric {
            name: name.to_owned(),
            duration,
            start_time,
            end_time: start_time + duration,
            metadata: metadata.unwrap_or_default(),
        })
    }

    pub fn record_pre_dump(&mut self, metric: PhaseMetric) {
        self.metrics.pre_dump_iterations.push(metric);
    }

    pub fn record_final_dump(&mut self, metric: PhaseMetric) {
        self.metrics.final_dump = Some(metric);
    }

    pub fn record_transfer(&mut self, mut metric: PhaseMetric, method: &str) {
        metric
            .metadata
            .insert("method".into(), Value::from(method));
        self.metrics.transfer = Some(metric);
    }

    pub fn record_restore(&mut self, metric: PhaseMetric) {
        self.metrics.restore = Some(metric);
    }

    pub fn record_lazy_pages_completion(&mut self, metric: PhaseMetric) {
        self.metrics.lazy_pages_completion = Some(metric);
    }

    pub fn add_custom_metric(&mut self, metric: PhaseMetric) {
        self.metrics.custom_metrics.insert(metric.name.clone(), metric);
    }

    /// Mark the run as failed. The document is still written so partial
    /// data survives for diagnosis.
    pub fn record_failure(&mut self, error: &str) {
        self.metrics.success = false;
        self.metrics.error = Some(error.to_owned());
    }

    /// Stamp the total wall duration and hand back the finished record.
    pub fn finalize(&mut self) -> &ExperimentMetrics {
        self.metrics.total_duration = self.run_start.elapsed().as_secs_f64();
        &self.metrics
    }

    pub fn save_to_file(&mut self, path: &Path) -> Result<(), failure::Error> {
        self.finalize();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.metrics)?;
        std::fs::File::create(path)?.write_all(json.as_bytes())?;
        Ok(())
    }

    pub fn print_summary(&self) {
        let m = &self.metrics;

        println!();
        println!("{}", style("=".repeat(60)).dim());
        println!(
            "{} {}",
            style("Migration experiment:").bold(),
            m.experiment_name
        );
        println!("Workload: {}", m.workload_type);
        println!("{}", style("=".repeat(60)).dim());

        if !m.pre_dump_iterations.is_empty() {
            let total: f64 = m.pre_dump_iterations.iter().map(|p| p.duration).sum();
            println!(
                "Pre-dumps: {} iterations, {:.2}s total, {:.2}s avg",
                m.pre_dump_iterations.len(),
                total,
                total / m.pre_dump_iterations.len() as f64
            );
            for (i, p) in m.pre_dump_iterations.iter().enumerate() {
                println!("  iteration {}: {:.2}s", i + 1, p.duration);
            }
        }

        if let Some(p) = &m.final_dump {
            println!("Final dump: {:.2}s", p.duration);
        }

        if let Some(p) = &m.transfer {
            print!("Transfer: {:.2}s", p.duration);
            if let Some(method) = p.metadata.get("method").and_then(Value::as_str) {
                print!(" via {}", method);
            }
            if let Some(mb) = p.metadata.get("size_mb").and_then(Value::as_f64) {
                if mb > 0.0 && p.duration > 0.0 {
                    print!(" ({:.2} MB, {:.2} MB/s)", mb, mb / p.duration);
                }
            }
            println!();
        }

        if let Some(p) = &m.restore {
            println!("Restore: {:.2}s", p.duration);
        }

        if let Some(p) = &m.lazy_pages_completion {
            let completed = p
                .metadata
                .get("completed")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if completed {
                println!("Lazy pages: {:.2}s", p.duration);
            } else {
                println!("Lazy pages: incomplete after {:.2}s", p.duration);
            }
        }

        for (name, p) in &m.custom_metrics {
            println!("{}: {:.2}s", name, p.duration);
        }

        println!("Total: {:.2}s", m.total_duration);

        if m.success {
            println!("{}", style("EXPERIMENT COMPLETED SUCCESSFULLY").green().bold());
        } else {
            println!(
                "{} {}",
                style("EXPERIMENT FAILED:").red().bold(),
                m.error.as_ref().map(String::as_str).unwrap_or("unknown")
            );
        }
        println!("{}", style("=".repeat(60)).dim());
    }
}

#[cfg(test)]
mod test {
    use super::MetricsCollector;
    use serde_json::{Map, Value};

    #[test]
    fn timer_roundtrip() {
        let mut collector = MetricsCollector::new("test", "memory");

        collector.start_timer("X");
        std::thread::sleep(std::time::Duration::from_millis(10));
        let metric = collector.stop_timer("X", None).unwrap();

        assert_eq!(metric.name, "X");
        assert!(metric.duration >= 0.01);
        assert!((metric.end_time - metric.start_time - metric.duration).abs() < 1e-12);

        let json = serde_json::to_string(&metric).unwrap();
        let back: super::PhaseMetric = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metric);
    }

    #[test]
    fn stopping_unknown_timer_is_an_error() {
        let mut collector = MetricsCollector::new("test", "memory");
        assert!(collector.stop_timer("never-started", None).is_err());
    }

    #[test]
    fn document_roundtrip() {
        let mut collector = MetricsCollector::new("exp1", "redis");
        collector.set_nodes("10.0.0.1", "10.0.0.2");

        collector.start_timer("pre_dump_1");
        let m = collector.stop_timer("pre_dump_1", None).unwrap();
        collector.record_pre_dump(m);

        collector.start_timer("transfer");
        let mut meta = Map::new();
        meta.insert("size_mb".into(), Value::from(12.5));
        let m = collector.stop_timer("transfer", Some(meta)).unwrap();
        collector.record_transfer(m, "rsync");

        collector.start_timer("workload_deploy");
        let m = collector.stop_timer("workload_deploy", None).unwrap();
        collector.add_custom_metric(m);

        let metrics = collector.finalize().clone();
        let json = serde_json::to_string(&metrics).unwrap();
        let back: super::ExperimentMetrics = serde_json::from_str(&json).unwrap();

        assert_eq!(back.experiment_name, "exp1");
        assert_eq!(back.workload_type, "redis");
        assert_eq!(back.pre_dump_iterations.len(), 1);
        assert_eq!(back.nodes["source"], "10.0.0.1");
        let transfer = back.transfer.unwrap();
        assert_eq!(transfer.metadata["method"], "rsync");
        assert_eq!(transfer.metadata["size_mb"], 12.5);
        assert!(back.custom_metrics.contains_key("workload_deploy"));
        assert!(back.success);
    }
}
