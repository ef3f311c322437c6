use camino::Utf8PathBuf;
use chrono::{TimeDelta, Utc};
use serde::Deserialize;

use super::{
    Credential, CredentialError, CredentialProvider, HttpClient, fetch_json, form_request,
};

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com/";
const ARM_SCOPE: &str = "https://management.azure.com/.default";
const JWT_BEARER: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// ACR accepts refresh tokens with this placeholder username.
const ACR_USERNAME: &str = "00000000-0000-0000-0000-000000000000";

/// ACR refresh tokens outlive this, but the ARM token they came from may not.
const ACR_TOKEN_LIFETIME: i64 = 3 * 60 * 60;

/// Workload identity settings, as injected by the Azure webhook.
#[derive(Debug, Clone, Default)]
pub struct AzureIdentity {
    /// `AZURE_CLIENT_ID`
    pub client_id: Option<String>,
    /// `AZURE_TENANT_ID`
    pub tenant_id: Option<String>,
    /// `AZURE_FEDERATED_TOKEN_FILE`
    pub token_file: Option<Utf8PathBuf>,
    /// `AZURE_AUTHORITY_HOST`
    pub authority: Option<String>,
}

impl AzureIdentity {
    /// Read the identity from the environment.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            client_id: var("AZURE_CLIENT_ID"),
            tenant_id: var("AZURE_TENANT_ID"),
            token_file: var("AZURE_FEDERATED_TOKEN_FILE").map(Utf8PathBuf::from),
            authority: var("AZURE_AUTHORITY_HOST"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AadToken {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AcrExchange {
    refresh_token: String,
}

/// Credentials for Azure Container Registry through workload identity
/// federation: the federated token is exchanged at AAD for an ARM token,
/// which ACR exchanges for a registry refresh token.
#[derive(Debug)]
pub struct AzureCredentials {
    registry: String,
    identity: AzureIdentity,
    client: HttpClient,
}

impl AzureCredentials {
    /// Credentials for `registry` (a `*.azurecr.io` host).
    pub fn new(registry: impl Into<String>, identity: AzureIdentity, client: HttpClient) -> Self {
        Self {
            registry: registry.into(),
            identity,
            client,
        }
    }
}

fn required<'a, T: ?Sized>(value: Option<&'a T>, name: &str) -> Result<&'a T, CredentialError> {
    value.ok_or_else(|| CredentialError::Missing(name.to_owned()))
}

#[async_trait::async_trait]
impl CredentialProvider for AzureCredentials {
    async fn credential(&self) -> Result<Option<Credential>, CredentialError> {
        let client_id = required(self.identity.client_id.as_deref(), "AZURE_CLIENT_ID")?;
        let tenant_id = required(self.identity.tenant_id.as_deref(), "AZURE_TENANT_ID")?;
        let token_file = required(
            self.identity.token_file.as_deref(),
            "AZURE_FEDERATED_TOKEN_FILE",
        )?;
        let authority = self
            .identity
            .authority
            .as_deref()
            .unwrap_or(DEFAULT_AUTHORITY)
            .trim_end_matches('/');

        let assertion = tokio::fs::read_to_string(token_file).await?;
        let aad: AadToken = fetch_json(
            &self.client,
            form_request(
                &format!("{authority}/{tenant_id}/oauth2/v2.0/token"),
                &[
                    ("client_id", client_id),
                    ("scope", ARM_SCOPE),
                    ("grant_type", "client_credentials"),
                    ("client_assertion_type", JWT_BEARER),
                    ("client_assertion", assertion.trim()),
                ],
            )?,
        )
        .await?;

        let exchange: AcrExchange = fetch_json(
            &self.client,
            form_request(
                &format!("https://{}/oauth2/exchange", self.registry),
                &[
                    ("grant_type", "access_token"),
                    ("service", self.registry.as_str()),
                    ("tenant", tenant_id),
                    ("access_token", aad.access_token.as_str()),
                ],
            )?,
        )
        .await?;

        let lifetime = aad
            .expires_in
            .unwrap_or(ACR_TOKEN_LIFETIME)
            .min(ACR_TOKEN_LIFETIME);
        tracing::debug!(registry = %self.registry, lifetime, "exchanged ACR refresh token");

        Ok(Some(
            Credential::new(ACR_USERNAME, exchange.refresh_token)
                .expires(Utc::now() + TimeDelta::seconds(lifetime)),
        ))
    }
}
