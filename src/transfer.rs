//! Moving checkpoint data from source to destination.
//!
//! Four transports: rsync over SSH, staging through S3, a shared EFS
//! filesystem (no copy at all), and an EBS volume (sync to the mount; the
//! volume detach/attach choreography is an operational step outside this
//! manager). No transport retries here.

use log::info;
use serde::Serialize;
use spurs::cmd;

use crate::error::RunnerError;
use crate::lazy::LazyConfig;
use crate::objstore::S3Config;
use crate::remote::SshPool;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMethod {
    Rsync,
    S3,
    Efs,
    Ebs,
}

impl TransferMethod {
    pub fn from_cli(s: &str) -> Result<Self, String> {
        match s {
            "rsync" => Ok(TransferMethod::Rsync),
            "s3" => Ok(TransferMethod::S3),
            "efs" => Ok(TransferMethod::Efs),
            "ebs" => Ok(TransferMethod::Ebs),
            other => Err(format!("unknown transfer method: {}", other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferMethod::Rsync => "rsync",
            TransferMethod::S3 => "s3",
            TransferMethod::Efs => "efs",
            TransferMethod::Ebs => "ebs",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferConfig {
    pub method: TransferMethod,
    /// Directory on the destination the checkpoint lands in.
    pub dest_dir: String,
    pub efs_mount: String,
    pub ebs_mount: String,
    /// Delete previous checkpoint objects before an S3 upload so a stale
    /// image set never shadows the new one.
    pub purge_before_upload: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            method: TransferMethod::Rsync,
            dest_dir: "/tmp/criu_checkpoint".into(),
            efs_mount: "/mnt/efs".into(),
            ebs_mount: "/mnt/ebs_test".into(),
            purge_before_upload: false,
        }
    }
}

/// What a transfer did, uniform across transports. Lands in the metrics
/// record as the transfer phase metadata.
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub method: &'static str,
    pub size_mb: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

pub struct TransferManager {
    config: TransferConfig,
    s3: Option<S3Config>,
}

impl TransferManager {
    pub fn new(config: TransferConfig, s3: Option<S3Config>) -> Self {
        TransferManager { config, s3 }
    }

    pub fn method(&self) -> TransferMethod {
        self.config.method
    }

    /// Move the final checkpoint directory to the destination.
    pub fn transfer(
        &self,
        pool: &mut SshPool,
        source_host: &str,
        dest_host: &str,
        checkpoint_dir: &str,
        lazy: &LazyConfig,
    ) -> Result<TransferResult, failure::Error> {
        match self.config.method {
            TransferMethod::Rsync => self.rsync(pool, source_host, dest_host, checkpoint_dir),
            TransferMethod::S3 => self.s3_sync(pool, source_host, dest_host, checkpoint_dir, lazy),
            TransferMethod::Efs => self.efs(pool, source_host, checkpoint_dir),
            TransferMethod::Ebs => self.ebs(pool, source_host, checkpoint_dir),
        }
    }

    /// Sync a pre-dump directory onto the transfer medium between
    /// iterations. Meaningful for EBS (rsync into the mount); EFS is
    /// already shared and everything else transfers at the end.
    pub fn sync_to_medium(
        &self,
        pool: &mut SshPool,
        source_host: &str,
        checkpoint_dir: &str,
    ) -> Result<(), failure::Error> {
        if self.config.method == TransferMethod::Ebs {
            let rsync = format!(
                "rsync -av --update --inplace --links {} {}/",
                checkpoint_dir, self.config.ebs_mount
            );
            pool.run(source_host, cmd!("{}", rsync).use_bash())
                .map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    fn fail(&self, err: failure::Error) -> failure::Error {
        RunnerError::Transfer {
            method: self.config.method.as_str().to_owned(),
            detail: err.to_string(),
        }
        .into()
    }

    fn rsync(
        &self,
        pool: &mut SshPool,
        source_host: &str,
        dest_host: &str,
        checkpoint_dir: &str,
    ) -> Result<TransferResult, failure::Error> {
        let rsync = rsync_cmd(checkpoint_dir, pool.user(), dest_host, &self.config.dest_dir);

        info!("rsync {} -> {}", source_host, dest_host);
        let out = pool
            .run(source_host, cmd!("{}", rsync).use_bash())
            .map_err(|e| self.fail(e))?;

        Ok(TransferResult {
            method: "rsync",
            size_mb: parse_rsync_total_size_mb(&out.stdout),
            upload_duration_secs: None,
            download_duration_secs: None,
            note: None,
        })
    }

    fn s3_sync(
        &self,
        pool: &mut SshPool,
        source_host: &str,
        dest_host: &str,
        checkpoint_dir: &str,
        lazy: &LazyConfig,
    ) -> Result<TransferResult, failure::Error> {
        let s3 = self
            .s3
            .as_ref()
            .ok_or_else(|| self.fail(failure::format_err!("s3 transfer without s3 config")))?;

        if self.config.purge_before_upload {
            pool.run(source_host, cmd!("{}", s3.purge_cmd()).use_bash())
                .map_err(|e| self.fail(e))?;
        }

        info!("uploading {} to {}", checkpoint_dir, s3.s3_uri());
        let upload_start = std::time::Instant::now();
        pool.run(source_host, cmd!("{}", s3.upload_cmd(checkpoint_dir)).use_bash())
            .map_err(|e| self.fail(e))?;
        let upload_secs = upload_start.elapsed().as_secs_f64();

        let size_mb = du_mb(pool, source_host, checkpoint_dir);

        // Page images stay in object storage for every lazy mode; CRIU
        // fetches them on demand.
        let exclude_pages = lazy.requires_lazy_pages();
        let download = s3.download_cmd(checkpoint_dir, exclude_pages);

        info!("downloading {} on {}", s3.s3_uri(), dest_host);
        let download_start = std::time::Instant::now();
        pool.run(dest_host, cmd!("mkdir -p {}", checkpoint_dir))
            .map_err(|e| self.fail(e))?;
        pool.run(dest_host, cmd!("{}", download).use_bash())
            .map_err(|e| self.fail(e))?;
        let download_secs = download_start.elapsed().as_secs_f64();

        Ok(TransferResult {
            method: "s3",
            size_mb,
            upload_duration_secs: Some(upload_secs),
            download_duration_secs: Some(download_secs),
            note: None,
        })
    }

    fn efs(
        &self,
        pool: &mut SshPool,
        source_host: &str,
        checkpoint_dir: &str,
    ) -> Result<TransferResult, failure::Error> {
        if !checkpoint_dir.starts_with(&self.config.efs_mount) {
            log::warn!(
                "checkpoint dir {} is not under the efs mount {}",
                checkpoint_dir,
                self.config.efs_mount
            );
        }

        Ok(TransferResult {
            method: "efs",
            size_mb: du_mb(pool, source_host, checkpoint_dir),
            upload_duration_secs: None,
            download_duration_secs: None,
            note: Some("shared filesystem, no transfer needed".into()),
        })
    }

    fn ebs(
        &self,
        pool: &mut SshPool,
        source_host: &str,
        checkpoint_dir: &str,
    ) -> Result<TransferResult, failure::Error> {
        let rsync = format!(
            "rsync -av --update --inplace --links {} {}/",
            checkpoint_dir, self.config.ebs_mount
        );

        info!("syncing {} into {}", checkpoint_dir, self.config.ebs_mount);
        let out = pool
            .run(source_host, cmd!("{}", rsync).use_bash())
            .map_err(|e| self.fail(e))?;

        Ok(TransferResult {
            method: "ebs",
            size_mb: parse_rsync_total_size_mb(&out.stdout),
            upload_duration_secs: None,
            download_duration_secs: None,
            note: Some("synced to volume; detach/attach is a separate step".into()),
        })
    }
}

/// Best-effort size of a remote directory in MB.
fn du_mb(pool: &mut SshPool, host: &str, dir: &str) -> f64 {
    match pool.exec(host, &format!("du -sm {}", dir), Some(30)) {
        Ok(out) if out.ok() => out
            .stdout
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

/// The rsync invocation the source host runs to push a checkpoint
/// directory to the destination.
pub fn rsync_cmd(checkpoint_dir: &str, user: &str, dest_host: &str, dest_dir: &str) -> String {
    format!(
        "rsync -av --update --inplace --links {} {}@{}:{}",
        checkpoint_dir, user, dest_host, dest_dir
    )
}

/// Pull the byte count out of rsync's `total size is N` trailer.
pub fn parse_rsync_total_size_mb(stdout: &str) -> f64 {
    for line in stdout.lines() {
        if let Some(idx) = line.find("total size is") {
            let rest = &line[idx + "total size is".len()..];
            if let Some(tok) = rest.split_whitespace().next() {
                if let Ok(bytes) = tok.replace(",", "").parse::<f64>() {
                    return bytes / (1024.0 * 1024.0);
                }
            }
        }
    }
    0.0
}

#[cfg(test)]
mod test {
    use super::{parse_rsync_total_size_mb, rsync_cmd};

    #[test]
    fn rsync_command_shape() {
        assert_eq!(
            rsync_cmd("/tmp/criu_checkpoint/3", "ubuntu", "10.0.0.2", "/tmp/criu_checkpoint"),
            "rsync -av --update --inplace --links /tmp/criu_checkpoint/3 \
             ubuntu@10.0.0.2:/tmp/criu_checkpoint"
        );
    }

    #[test]
    fn rsync_size_parsing() {
        let out = "sending incremental file list\n3/\n3/pages-1.img\n\n\
                   sent 1,234 bytes  received 56 bytes  860.00 bytes/sec\n\
                   total size is 10,485,760  speedup is 8127.76\n";
        let mb = parse_rsync_total_size_mb(out);
        assert!((mb - 10.0).abs() < 1e-9);
    }

    #[test]
    fn rsync_size_absent() {
        assert_eq!(parse_rsync_total_size_mb("no trailer here"), 0.0);
    }
}
