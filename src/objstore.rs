//! Object-storage (S3) configuration for checkpoint staging.
//!
//! Derives the `aws s3` command lines used for upload and download, and
//! the object-storage argument vector handed to the `criu lazy-pages`
//! daemon when pages are fetched on demand.

use serde::{Deserialize, Serialize};

/// Which flavor of storage serves page fetches on the restore side.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum S3Kind {
    /// Plain S3: upload and fetch straight from the bucket.
    Standard,
    /// Upload to S3; CRIU fetches pages through a CDN distribution.
    Cloudfront,
    /// S3 Express One Zone: needs explicit credentials and region.
    ExpressOneZone,
}

impl S3Kind {
    pub fn from_cli(s: &str) -> Result<Self, String> {
        match s {
            "standard" => Ok(S3Kind::Standard),
            "cloudfront" => Ok(S3Kind::Cloudfront),
            "express-one-zone" => Ok(S3Kind::ExpressOneZone),
            other => Err(format!("unknown s3 type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub kind: S3Kind,

    /// Bucket the source node uploads the checkpoint into.
    pub upload_bucket: String,
    /// Object prefix, no leading or trailing slash.
    pub upload_prefix: String,
    pub upload_region: String,

    /// Endpoint CRIU fetches pages from: `s3.{region}.amazonaws.com`,
    /// a CDN distribution hostname, or an Express One Zone endpoint.
    pub download_endpoint: String,
    /// Bucket for CRIU fetches. Defaults to the upload bucket; stays
    /// empty for CDN endpoints.
    pub download_bucket: String,

    pub access_key: String,
    pub secret_key: String,
}

impl S3Config {
    pub fn new(kind: S3Kind, upload_bucket: &str, upload_prefix: &str) -> Self {
        let mut cfg = S3Config {
            kind,
            upload_bucket: upload_bucket.to_owned(),
            upload_prefix: upload_prefix.trim_matches('/').to_owned(),
            upload_region: String::new(),
            download_endpoint: String::new(),
            download_bucket: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
        };
        if cfg.kind != S3Kind::Cloudfront {
            cfg.download_bucket = cfg.upload_bucket.clone();
        }
        cfg
    }

    /// Full S3 URI of the checkpoint location.
    pub fn s3_uri(&self) -> String {
        if self.upload_prefix.is_empty() {
            format!("s3://{}/", self.upload_bucket)
        } else {
            format!("s3://{}/{}/", self.upload_bucket, self.upload_prefix)
        }
    }

    /// Command that removes any previous checkpoint objects so a stale
    /// image set never shadows the new one.
    pub fn purge_cmd(&self) -> String {
        format!("aws s3 rm {} --recursive --quiet", self.s3_uri())
    }

    /// Command the source node runs to upload the checkpoint directory.
    pub fn upload_cmd(&self, local_dir: &str) -> String {
        format!("aws s3 sync {}/ {} --quiet", local_dir, self.s3_uri())
    }

    /// Command the destination node runs to download the checkpoint.
    ///
    /// With `exclude_pages`, `pages-*.img` stays in object storage and is
    /// fetched on demand by CRIU instead.
    pub fn download_cmd(&self, local_dir: &str, exclude_pages: bool) -> String {
        let mut cmd = format!("aws s3 sync {} {}/ --quiet", self.s3_uri(), local_dir);
        if exclude_pages {
            cmd.push_str(" --exclude 'pages-*.img'");
        }
        cmd
    }

    /// Object-storage argument vector for CRIU.
    pub fn criu_object_storage_args(&self) -> Vec<String> {
        let mut args = vec![
            "--enable-object-storage".to_owned(),
            "--object-storage-endpoint-url".to_owned(),
            self.download_endpoint.clone(),
        ];

        if self.kind != S3Kind::Cloudfront && !self.download_bucket.is_empty() {
            args.push("--object-storage-bucket".to_owned());
            args.push(self.download_bucket.clone());
        }

        if !self.upload_prefix.is_empty() {
            args.push("--object-storage-object-prefix".to_owned());
            args.push(format!("{}/", self.upload_prefix));
        }

        if self.kind == S3Kind::ExpressOneZone {
            args.push("--express-one-zone".to_owned());
            if !self.access_key.is_empty() {
                args.push("--aws-access-key".to_owned());
                args.push(self.access_key.clone());
            }
            if !self.secret_key.is_empty() {
                args.push("--aws-secret-key".to_owned());
                args.push(self.secret_key.clone());
            }
            if !self.upload_region.is_empty() {
                args.push("--aws-region".to_owned());
                args.push(self.upload_region.clone());
            }
        }

        args
    }

    /// Configuration errors, empty when usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = vec![];

        if self.upload_bucket.is_empty() {
            errors.push("upload bucket is required".to_owned());
        }
        if self.download_endpoint.is_empty() {
            errors.push("download endpoint is required".to_owned());
        }
        if self.kind == S3Kind::ExpressOneZone {
            if self.access_key.is_empty() {
                errors.push("access key is required for express-one-zone".to_owned());
            }
            if self.secret_key.is_empty() {
                errors.push("secret key is required for express-one-zone".to_owned());
            }
            if self.upload_region.is_empty() {
                errors.push("region is required for express-one-zone".to_owned());
            }
        }

        errors
    }
}

#[cfg(test)]
mod test {
    use super::{S3Config, S3Kind};

    fn cfg() -> S3Config {
        let mut cfg = S3Config::new(S3Kind::Standard, "b", "p");
        cfg.download_endpoint = "s3.us-east-1.amazonaws.com".into();
        cfg
    }

    #[test]
    fn sync_commands() {
        let cfg = cfg();
        assert_eq!(
            cfg.upload_cmd("/tmp/criu_checkpoint/3"),
            "aws s3 sync /tmp/criu_checkpoint/3/ s3://b/p/ --quiet"
        );
        assert_eq!(
            cfg.download_cmd("/tmp/criu_checkpoint/3", false),
            "aws s3 sync s3://b/p/ /tmp/criu_checkpoint/3/ --quiet"
        );
    }

    #[test]
    fn page_exclusion_follows_lazy_mode() {
        let cfg = cfg();
        let lazy = cfg.download_cmd("/tmp/d", true);
        assert!(lazy.contains("--exclude 'pages-*.img'"));
        let eager = cfg.download_cmd("/tmp/d", false);
        assert!(!eager.contains("--exclude"));
    }

    #[test]
    fn prefix_is_normalized() {
        let cfg = S3Config::new(S3Kind::Standard, "bucket", "/checkpoints/exp1/");
        assert_eq!(cfg.s3_uri(), "s3://bucket/checkpoints/exp1/");
        assert_eq!(cfg.download_bucket, "bucket");
    }

    #[test]
    fn object_storage_args_standard() {
        let cfg = cfg();
        assert_eq!(
            cfg.criu_object_storage_args(),
            vec![
                "--enable-object-storage",
                "--object-storage-endpoint-url",
                "s3.us-east-1.amazonaws.com",
                "--object-storage-bucket",
                "b",
                "--object-storage-object-prefix",
                "p/",
            ]
        );
    }

    #[test]
    fn express_one_zone_needs_credentials() {
        let mut cfg = S3Config::new(S3Kind::ExpressOneZone, "b", "p");
        cfg.download_endpoint = "s3express-use1-az4.us-east-1.amazonaws.com".into();
        assert_eq!(cfg.validate().len(), 3);

        cfg.access_key = "AK".into();
        cfg.secret_key = "SK".into();
        cfg.upload_region = "us-east-1".into();
        assert!(cfg.validate().is_empty());

        let args = cfg.criu_object_storage_args();
        assert!(args.contains(&"--express-one-zone".to_owned()));
        assert!(args.windows(2).any(|w| w == ["--aws-region", "us-east-1"]));
    }
}
