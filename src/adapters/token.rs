//! Bearer credential sources.
//!
//! Credentials are acquired outside this crate. We either read an already
//! minted token from the environment or ask the `gcloud` CLI for one.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use super::{ApiError, TokenProvider};

/// Environment variables checked for a pre-minted token, in order
pub const TOKEN_ENV_VARS: [&str; 2] = ["LAKEHOUSE_ACCESS_TOKEN", "GOOGLE_OAUTH_ACCESS_TOKEN"];

/// A fixed token (tests, CI with short-lived injected tokens)
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, ApiError> {
        Ok(self.token.clone())
    }
}

/// Reads the token from the environment on every call
#[derive(Default)]
pub struct EnvTokenProvider;

impl EnvTokenProvider {
    /// First non-empty token variable, if any
    pub fn lookup() -> Option<String> {
        TOKEN_ENV_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|v| !v.trim().is_empty())
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn access_token(&self) -> Result<String, ApiError> {
        Self::lookup().ok_or_else(|| {
            ApiError::Credentials(format!("none of {} is set", TOKEN_ENV_VARS.join(", ")))
        })
    }
}

/// Shells out to `gcloud auth print-access-token`
pub struct GcloudTokenProvider {
    /// Path to the gcloud binary (default: "gcloud")
    binary_path: String,

    call_timeout: Duration,
}

impl Default for GcloudTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GcloudTokenProvider {
    pub fn new() -> Self {
        Self {
            binary_path: "gcloud".to_string(),
            call_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            ..Self::new()
        }
    }
}

#[async_trait]
impl TokenProvider for GcloudTokenProvider {
    async fn access_token(&self) -> Result<String, ApiError> {
        let child = Command::new(&self.binary_path)
            .args(["auth", "print-access-token"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ApiError::Credentials(format!("failed to spawn {}: {}", self.binary_path, e)))?;

        let output = timeout(self.call_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ApiError::Credentials(format!(
                    "{} auth print-access-token timed out after {:?}",
                    self.binary_path, self.call_timeout
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ApiError::Credentials(format!(
                "{} exited with code {}: {}",
                self.binary_path,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(ApiError::Credentials("gcloud returned an empty token".to_string()));
        }
        Ok(token)
    }
}

/// Environment token when present, otherwise gcloud
pub fn default_provider() -> Arc<dyn TokenProvider> {
    if EnvTokenProvider::lookup().is_some() {
        Arc::new(EnvTokenProvider)
    } else {
        Arc::new(GcloudTokenProvider::new())
    }
}
