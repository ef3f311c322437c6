use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use storage::sigv4::{self, AwsCredentials, SigningParams};

use super::{Credential, CredentialError, CredentialProvider, HttpClient, fetch, fetch_json};

const ECR_TARGET: &str = "AmazonEC2ContainerRegistry_V20150921.GetAuthorizationToken";
const DEFAULT_REGION: &str = "us-east-1";

/// Where AWS credentials for ECR come from.
#[derive(Debug, Clone)]
pub enum AwsIdentity {
    /// Fixed access keys.
    Static(AwsCredentials),
    /// A web identity token exchanged at STS for a role session.
    WebIdentity {
        /// Role to assume.
        role_arn: String,
        /// File holding the OIDC token.
        token_file: Utf8PathBuf,
        /// Session name reported to STS.
        session_name: String,
    },
}

impl AwsIdentity {
    /// A web identity when `AWS_ROLE_ARN` and `AWS_WEB_IDENTITY_TOKEN_FILE`
    /// are set, otherwise the static `AWS_ACCESS_KEY_ID` keys.
    pub fn from_env() -> Option<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        if let (Some(role_arn), Some(token_file)) =
            (var("AWS_ROLE_ARN"), var("AWS_WEB_IDENTITY_TOKEN_FILE"))
        {
            return Some(AwsIdentity::WebIdentity {
                role_arn,
                token_file: token_file.into(),
                session_name: var("AWS_ROLE_SESSION_NAME").unwrap_or_else(|| "kiln".into()),
            });
        }
        AwsCredentials::from_env().map(AwsIdentity::Static)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationData {
    authorization_token: String,
    #[serde(default)]
    expires_at: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationResponse {
    authorization_data: Vec<AuthorizationData>,
}

/// Credentials for ECR, from a SigV4-signed `GetAuthorizationToken`.
#[derive(Debug)]
pub struct AwsEcrCredentials {
    registry: String,
    region: String,
    identity: Option<AwsIdentity>,
    client: HttpClient,
}

/// `<account>.dkr.ecr.<region>.amazonaws.com` → `<region>`.
fn ecr_region(host: &str) -> Option<&str> {
    let mut labels = host.split('.');
    labels.position(|label| label == "ecr")?;
    labels.next().filter(|region| !region.is_empty())
}

impl AwsEcrCredentials {
    /// Credentials for an ECR registry host.
    pub fn new(
        registry: impl Into<String>,
        identity: Option<AwsIdentity>,
        client: HttpClient,
    ) -> Self {
        let registry = registry.into();
        let region = ecr_region(&registry).unwrap_or(DEFAULT_REGION).to_owned();
        Self {
            registry,
            region,
            identity,
            client,
        }
    }

    async fn assume_role(
        &self,
        role_arn: &str,
        token_file: &Utf8PathBuf,
        session_name: &str,
    ) -> Result<(AwsCredentials, Option<DateTime<Utc>>), CredentialError> {
        let token = tokio::fs::read_to_string(token_file).await?;
        let query = serde_urlencoded::to_string([
            ("Action", "AssumeRoleWithWebIdentity"),
            ("Version", "2011-06-15"),
            ("RoleArn", role_arn),
            ("RoleSessionName", session_name),
            ("WebIdentityToken", token.trim()),
        ])
        .map_err(|error| CredentialError::Decode(error.to_string()))?;

        let request = http::Request::get(format!(
            "https://sts.{}.amazonaws.com/?{query}",
            self.region
        ))
        .body(hyperdriver::Body::empty())
        .map_err(|error| CredentialError::Decode(error.to_string()))?;

        let body = fetch(&self.client, request).await?;
        let document = String::from_utf8_lossy(&body);
        let field = |tag: &str| {
            storage::xml::tag_value(&document, tag)
                .ok_or_else(|| CredentialError::Decode(format!("STS response has no {tag}")))
        };

        let credentials = AwsCredentials::new(
            field("AccessKeyId")?,
            field("SecretAccessKey")?,
            Some(field("SessionToken")?),
        );
        let expires = storage::xml::tag_value(&document, "Expiration")
            .and_then(|value| DateTime::parse_from_rfc3339(&value).ok())
            .map(|value| value.with_timezone(&Utc));

        tracing::debug!(%role_arn, "assumed role with web identity");
        Ok((credentials, expires))
    }
}

#[async_trait::async_trait]
impl CredentialProvider for AwsEcrCredentials {
    async fn credential(&self) -> Result<Option<Credential>, CredentialError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| CredentialError::Missing("AWS credentials".into()))?;

        let (credentials, role_expires) = match identity {
            AwsIdentity::Static(credentials) => (credentials.clone(), None),
            AwsIdentity::WebIdentity {
                role_arn,
                token_file,
                session_name,
            } => self.assume_role(role_arn, token_file, session_name).await?,
        };

        let payload = Bytes::from_static(b"{}");
        let endpoint = format!("https://api.ecr.{}.amazonaws.com/", self.region);
        let mut request = http::Request::post(endpoint)
            .header(http::header::CONTENT_TYPE, "application/x-amz-json-1.1")
            .header("x-amz-target", ECR_TARGET)
            .body(hyperdriver::Body::from(payload.clone()))
            .map_err(|error| CredentialError::Decode(error.to_string()))?;

        let params = SigningParams {
            credentials: &credentials,
            region: &self.region,
            service: "ecr",
            time: Utc::now(),
        };
        sigv4::sign_request(&mut request, &params, &sigv4::payload_hash(&payload))
            .map_err(|error| CredentialError::Decode(error.to_string()))?;

        let response: AuthorizationResponse = fetch_json(&self.client, request).await?;
        let data = response
            .authorization_data
            .into_iter()
            .next()
            .ok_or_else(|| CredentialError::Decode("ECR returned no authorization data".into()))?;

        let decoded = BASE64_STANDARD
            .decode(data.authorization_token.trim())
            .map_err(|error| CredentialError::Decode(error.to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|error| CredentialError::Decode(error.to_string()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| CredentialError::Decode("ECR token is not user:password".into()))?;

        let token_expires = data
            .expires_at
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0));
        let expires = match (token_expires, role_expires) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        tracing::debug!(registry = %self.registry, ?expires, "resolved ECR credentials");
        let credential = Credential::new(username, password.to_owned());
        Ok(Some(match expires {
            Some(at) => credential.expires(at),
            None => credential,
        }))
    }
}
