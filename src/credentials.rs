//! Language-model credential loading
//!
//! The gateway itself never talks to the language model. It reads the API key
//! once at startup so a missing key fails fast, then hands it to every child
//! through the environment.

use crate::config::CredentialsConfig;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Environment variable {var} is not set; the sub-applications need it to reach the language model")]
    Missing { var: String },

    #[error("Environment variable {var} is set but empty")]
    Empty { var: String },

    #[error("Environment variable {var} is not valid unicode")]
    NotUnicode { var: String },
}

/// A secret value paired with the variable name it travels under
#[derive(Clone)]
pub struct Credential {
    env_var: String,
    value: String,
}

impl Credential {
    pub fn new(env_var: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            env_var: env_var.into(),
            value: value.into(),
        }
    }

    pub fn env_var(&self) -> &str {
        &self.env_var
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("env_var", &self.env_var)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Read the configured credential from the process environment.
///
/// Returns `Ok(None)` only when the credential is optional and absent.
pub fn load(config: &CredentialsConfig) -> Result<Option<Credential>, CredentialError> {
    if config.dotenv {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "Loaded .env file"),
            Err(e) if e.not_found() => {}
            Err(e) => warn!(error = %e, "Failed to read .env file"),
        }
    }

    from_lookup(config, |var| std::env::var(var))
}

fn from_lookup<F>(config: &CredentialsConfig, lookup: F) -> Result<Option<Credential>, CredentialError>
where
    F: FnOnce(&str) -> Result<String, std::env::VarError>,
{
    let var = config.env_var.as_str();
    let result = match lookup(var) {
        Ok(value) if value.trim().is_empty() => Err(CredentialError::Empty { var: var.to_string() }),
        Ok(value) => Ok(Credential::new(var, value)),
        Err(std::env::VarError::NotPresent) => Err(CredentialError::Missing { var: var.to_string() }),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(CredentialError::NotUnicode { var: var.to_string() })
        }
    };

    match result {
        Ok(credential) => {
            info!(env_var = var, "Language-model credential loaded");
            Ok(Some(credential))
        }
        Err(e) if !config.required => {
            warn!(env_var = var, error = %e, "Credential unavailable; children start without it");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
