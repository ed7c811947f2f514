//! The failure taxonomy of a migration run.
//!
//! Anything that breaks the pipeline invariant (a missing checkpoint can
//! never yield a restore) is one of these and aborts the run. Everything
//! observational (verification, log collection, dirty tracking) is
//! reported through record types instead and never aborts.

use failure::Fail;

#[derive(Debug, Fail)]
pub enum RunnerError {
    /// SSH connect or command delivery failed.
    #[fail(display = "transport failure on {}: {}", host, reason)]
    Transport { host: String, reason: String },

    /// Deploying the workload script or its dependencies failed.
    #[fail(display = "workload deploy failed on {}: {}", host, detail)]
    Deploy { host: String, detail: String },

    /// The workload never created its readiness file.
    #[fail(
        display = "workload not ready on {} after {}s",
        host, waited_secs
    )]
    ReadyTimeout { host: String, waited_secs: u64 },

    /// A CRIU invocation (pre-dump, dump, or restore) failed. Carries the
    /// tail of the CRIU log so the operator can diagnose without a
    /// round-trip to the remote host.
    #[fail(
        display = "{} failed after {:.2}s: {}\n--- criu log tail ---\n{}",
        phase, duration_secs, detail, log_tail
    )]
    CriuPhase {
        phase: String,
        duration_secs: f64,
        detail: String,
        log_tail: String,
    },

    /// A backgrounded dump never went quiet.
    #[fail(display = "dump did not quiesce within {}s", elapsed_secs)]
    QuiescenceTimeout { elapsed_secs: u64 },

    /// Moving checkpoint data between hosts failed.
    #[fail(display = "transfer via {} failed: {}", method, detail)]
    Transfer { method: String, detail: String },
}
