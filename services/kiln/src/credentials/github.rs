use super::{Credential, CredentialError, CredentialProvider, Secret};

/// Credentials for `ghcr.io`: `GITHUB_ACTOR`/`GITHUB_TOKEN`, falling back to
/// the `gh` CLI's login.
#[derive(Debug, Clone, Default)]
pub struct GithubCredentials {
    actor: Option<String>,
    token: Option<Secret>,
}

fn non_empty(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|value| !value.is_empty())
}

impl GithubCredentials {
    /// Use these values, asking `gh` for whatever is missing.
    pub fn new(actor: Option<String>, token: Option<Secret>) -> Self {
        Self { actor, token }
    }

    /// Read `GITHUB_ACTOR` and `GITHUB_TOKEN`.
    pub fn from_env() -> Self {
        Self {
            actor: non_empty("GITHUB_ACTOR"),
            token: non_empty("GITHUB_TOKEN").map(Secret::from),
        }
    }
}

async fn gh(args: &[&str]) -> Result<String, CredentialError> {
    let output = tokio::process::Command::new("gh")
        .args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(CredentialError::Command {
            program: format!("gh {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if stdout.is_empty() {
        return Err(CredentialError::Missing(format!(
            "output from gh {}",
            args.join(" ")
        )));
    }
    Ok(stdout)
}

#[async_trait::async_trait]
impl CredentialProvider for GithubCredentials {
    async fn credential(&self) -> Result<Option<Credential>, CredentialError> {
        let token = match &self.token {
            Some(token) => token.clone(),
            None => Secret::from(gh(&["auth", "token"]).await?),
        };
        let actor = match &self.actor {
            Some(actor) => actor.clone(),
            None => gh(&["api", "user", "--jq", ".login"]).await?,
        };

        tracing::debug!(%actor, "resolved GitHub credentials");
        Ok(Some(Credential::new(actor, token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_values_skip_the_cli() {
        let github = GithubCredentials::new(
            Some("octocat".into()),
            Some(Secret::from("ghp_token")),
        );
        let credential = github.credential().await.unwrap().unwrap();
        assert_eq!(credential.username, "octocat");
        assert_eq!(
            credential.authorization().to_str().unwrap(),
            "Basic b2N0b2NhdDpnaHBfdG9rZW4="
        );
    }
}
