//! Access token storage for the Earth Engine catalog.
//!
//! Credentials are an explicit value handed to the catalog; nothing here
//! touches the process environment.
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            refresh_token: None,
            expires_in: None,
            project: None,
        }
    }

    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    fn is_usable(&self) -> bool {
        !self.access_token.trim().is_empty()
    }
}

/// Interactive (or otherwise external) source of fresh credentials.
pub trait Authenticator {
    fn authenticate(&self) -> Result<Credentials>;
}

/// Asks for an access token on the terminal without echoing it, e.g. the
/// output of `gcloud auth print-access-token`.
pub struct PromptAuthenticator;

impl Authenticator for PromptAuthenticator {
    fn authenticate(&self) -> Result<Credentials> {
        let entered = rpassword::prompt_password("Earth Engine access token: ");
        token_from_prompt(entered)
    }
}

fn token_from_prompt(entered: io::Result<String>) -> Result<Credentials> {
    let entered =
        entered.map_err(|e| Error::Credentials(format!("Unable to read access token: {e}")))?;
    let token = entered.trim();
    if token.is_empty() {
        return Err(Error::Credentials("No access token entered".to_string()));
    }
    Ok(Credentials::new(token))
}

pub struct CredentialsStore {
    path: PathBuf,
}

impl CredentialsStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored credentials, or authenticate and store the result.
    ///
    /// A file that exists but cannot be parsed is an error: it is never
    /// silently overwritten.
    pub fn load_or_authenticate(&self, auth: &impl Authenticator) -> Result<Credentials> {
        if let Some(credentials) = self.load()? {
            if credentials.is_usable() {
                debug!(path = %self.path.display(), "Using stored credentials");
                return Ok(credentials);
            }
            warn!(path = %self.path.display(), "Stored access token is empty, authenticating");
        } else {
            debug!(path = %self.path.display(), "No stored credentials, authenticating");
        }

        self.authenticate(auth)
    }

    /// Load credentials and hand them to `connect`. When the provider
    /// rejects them with [`Error::Credentials`] (expired or revoked token),
    /// authenticate once more, persist the fresh credentials and connect again.
    pub async fn connect<T, F, Fut>(&self, auth: &impl Authenticator, mut connect: F) -> Result<T>
    where
        F: FnMut(Credentials) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let credentials = self.load_or_authenticate(auth)?;
        match connect(credentials).await {
            Err(Error::Credentials(reason)) => {
                warn!(path = %self.path.display(), reason = %reason, "Stored credentials were rejected, authenticating");
                let credentials = self.authenticate(auth)?;
                connect(credentials).await
            }
            other => other,
        }
    }

    fn authenticate(&self, auth: &impl Authenticator) -> Result<Credentials> {
        let credentials = auth.authenticate()?;
        if !credentials.is_usable() {
            return Err(Error::Credentials(
                "Authentication returned an empty access token".to_string(),
            ));
        }
        self.persist(&credentials)?;
        info!(path = %self.path.display(), "Saved new credentials");
        Ok(credentials)
    }

    fn load(&self) -> Result<Option<Credentials>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(|e| {
            Error::Credentials(format!("Unable to read {}: {e}", self.path.display()))
        })?;
        let credentials = serde_json::from_str(&content).map_err(|e| {
            Error::Credentials(format!(
                "Invalid credentials file {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(credentials))
    }

    pub fn persist(&self, credentials: &Credentials) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(credentials)
            .map_err(|e| Error::Credentials(format!("Unable to serialise credentials: {e}")))?;
        let partial = self.path.with_extension("json.partial");
        fs::write(&partial, content)?;
        fs::rename(&partial, &self.path)?;
        Ok(())
    }
}
