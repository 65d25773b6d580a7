//! Instance metadata service (IMDSv2) access.
//!
//! Identity and credentials are fetched with the token-then-fetch
//! handshake: a short-lived session token is acquired first and presented
//! on every metadata read.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::AwsError;

/// Link-local base URL of the EC2 instance metadata service.
const IMDS_URL_LATEST: &str = "http://169.254.169.254/latest";

/// Token validity requested during initialization. Initialization is the
/// only consumer, so one minute covers even slow connections.
const TOKEN_TTL_SECONDS: u32 = 60;

fn metadata_timeout() -> Duration {
    // Respect the standard AWS environment variable.
    let seconds = std::env::var("AWS_METADATA_SERVICE_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    Duration::from_secs(seconds)
}

/// Credentials for signing EC2 requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl Credentials {
    /// Credentials from the standard environment variables, if set.
    /// Takes precedence over the instance role, mirroring the SDK default
    /// provider chain.
    fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        Some(Self {
            access_key_id,
            secret_access_key,
            token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

/// Instance identity plus signing credentials, as discovered at startup.
#[derive(Debug, Clone)]
pub(crate) struct InstanceIdentity {
    pub instance_id: String,
    pub region: String,
    pub credentials: Credentials,
}

pub(crate) struct ImdsClient {
    http: reqwest::Client,
    base_url: String,
}

impl ImdsClient {
    pub(crate) fn new() -> Result<Self, AwsError> {
        // Respect the standard endpoint override, as used by tests that
        // stand in for the metadata service.
        let base_url = match std::env::var("AWS_EC2_METADATA_SERVICE_ENDPOINT") {
            Ok(endpoint) => format!("{}/latest", endpoint.trim_end_matches('/')),
            Err(_) => IMDS_URL_LATEST.to_string(),
        };
        Self::with_base_url(base_url)
    }

    /// Override the metadata endpoint, e.g. for a local stand-in server.
    pub(crate) fn with_base_url(base_url: String) -> Result<Self, AwsError> {
        let http = reqwest::Client::builder()
            .timeout(metadata_timeout())
            .build()?;
        Ok(Self { http, base_url })
    }

    /// Discover instance identity and signing credentials.
    pub(crate) async fn identity(&self) -> Result<InstanceIdentity, AwsError> {
        let token = self.token().await?;
        let instance_id = self.metadata("instance-id", &token).await?;
        let region = self.metadata("placement/region", &token).await?;
        debug!(instance_id = %instance_id, region = %region, "Fetched instance identity");

        let credentials = match Credentials::from_env() {
            Some(credentials) => credentials,
            None => self.role_credentials(&token).await?,
        };

        Ok(InstanceIdentity {
            instance_id,
            region,
            credentials,
        })
    }

    /// Acquire an IMDSv2 session token.
    async fn token(&self) -> Result<String, AwsError> {
        debug!("Getting session token for IMDSv2");
        let result = self
            .http
            .put(format!("{}/api/token", self.base_url))
            .header(
                "X-aws-ec2-metadata-token-ttl-seconds",
                TOKEN_TTL_SECONDS.to_string(),
            )
            .send()
            .await
            .and_then(|response| response.error_for_status());
        match result {
            Ok(response) => Ok(response.text().await?),
            Err(err) => {
                warn!("Unable to get EC2 token for use with IMDSv2");
                warn!(
                    "This may be due to the hop limit being too low (1) for pods to connect; \
                     run: aws ec2 modify-instance-metadata-options --instance-id <instance_id> \
                     --http-put-response-hop-limit 2 --http-endpoint enabled"
                );
                Err(err.into())
            }
        }
    }

    /// Read one metadata path as text.
    async fn metadata(&self, path: &str, token: &str) -> Result<String, AwsError> {
        let response = self
            .http
            .get(format!("{}/meta-data/{}", self.base_url, path))
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }

    /// Fetch the instance role's credentials document.
    async fn role_credentials(&self, token: &str) -> Result<Credentials, AwsError> {
        let roles = self.metadata("iam/security-credentials/", token).await?;
        let role = roles.lines().next().filter(|r| !r.is_empty()).ok_or_else(|| {
            AwsError::Permanent("no IAM role attached to the instance".to_string())
        })?;
        debug!(role = %role, "Fetching instance role credentials");
        let doc = self
            .metadata(&format!("iam/security-credentials/{role}"), token)
            .await?;
        serde_json::from_str(&doc).map_err(|err| {
            AwsError::Permanent(format!("malformed credentials document: {err}"))
        })
    }
}
