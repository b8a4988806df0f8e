//! Remote visibility checks.
//!
//! The verifier only needs one primitive from the remote store: "is this key
//! visible right now". Each call is a single request with no retry and no
//! caching; retrying is the verifier's job.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::error::DisplayErrorContext;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{AppConfig, CheckerType};

/// Used when neither the config nor the AWS environment names a region.
pub const FALLBACK_REGION: &str = "us-east-1";

/// A check that could not decide. Distinct from a negative answer.
#[derive(Debug, Error)]
pub enum CheckError {
    /// The store answered with something other than "found" or "not found",
    /// or could not be reached (`status` is `None`).
    #[error("check for {key} failed (status {status:?}): {message}")]
    Remote {
        key: String,
        status: Option<u16>,
        message: String,
    },
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    #[error("failed to stat {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ExistenceChecker: Send + Sync {
    /// Whether `key` is currently visible in `bucket`.
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, CheckError>;
}

/// `HeadObject` through the AWS SDK, signed with whatever credentials the
/// ambient AWS environment provides.
pub struct S3Checker {
    client: Client,
}

impl S3Checker {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the standard AWS config chain (env, profile,
    /// instance metadata). A custom `endpoint` is addressed path-style, as
    /// gateways and S3-compatible stores expect.
    pub async fn from_env(endpoint: Option<&str>, region: Option<&str>) -> Result<Self, CheckError> {
        if let Some(endpoint) = endpoint {
            validate_endpoint(endpoint)?;
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let sdk_config = loader.load().await;

        let mut builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).retry_config(RetryConfig::disabled());
        if sdk_config.region().is_none() {
            builder = builder.region(Region::new(FALLBACK_REGION));
        }
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self::new(Client::from_conf(builder.build())))
    }
}

#[async_trait]
impl ExistenceChecker for S3Checker {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, CheckError> {
        let result = self.client.head_object().bucket(bucket).key(key).send().await;

        let err = match result {
            Ok(_) => return Ok(true),
            Err(err) => err,
        };

        let status = err.raw_response().map(|r| r.status().as_u16());
        let not_found = err
            .as_service_error()
            .is_some_and(|e| e.is_not_found())
            || status == Some(404);

        if not_found {
            Ok(false)
        } else {
            Err(CheckError::Remote {
                key: key.to_string(),
                status,
                message: DisplayErrorContext(&err).to_string(),
            })
        }
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), CheckError> {
    let host = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"));
    match host {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => Err(CheckError::InvalidEndpoint(endpoint.to_string())),
    }
}

/// Treats `<root>/<bucket>/<key>` on a local filesystem as the remote view,
/// e.g. a read-only mount of the bucket.
pub struct LocalMirrorChecker {
    root: PathBuf,
}

impl LocalMirrorChecker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ExistenceChecker for LocalMirrorChecker {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, CheckError> {
        let mut path = self.root.join(bucket);
        path.extend(key.split('/'));

        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| CheckError::Io { path, source })
    }
}

/// Build the checker selected in the config.
pub async fn create_checker(config: &AppConfig) -> anyhow::Result<Arc<dyn ExistenceChecker>> {
    match config.checker {
        CheckerType::S3 => {
            let checker =
                S3Checker::from_env(config.endpoint.as_deref(), config.region.as_deref()).await?;
            Ok(Arc::new(checker))
        }
        CheckerType::Local => {
            let root = config
                .mirror_root
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("the local checker requires mirror_root"))?;
            Ok(Arc::new(LocalMirrorChecker::new(root)))
        }
    }
}
