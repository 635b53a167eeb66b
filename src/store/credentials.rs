//! Credential references for external databases.
//!
//! A connection never stores how its password is obtained beyond one of these
//! references; the secret itself is resolved right before dialing.

use crate::error::{CopilotError, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;

const SERVICE_NAME: &str = "db-copilot";

/// Where the password for a connection comes from.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum CredentialRef {
    #[default]
    None,
    /// Password stored with the connection record.
    Inline(String),
    /// Name of an environment variable holding the password.
    Env(String),
    /// OS keyring entry under the `db-copilot` service.
    Keyring(String),
}

impl CredentialRef {
    /// Resolves the reference to a password.
    ///
    /// A keyring entry that does not exist resolves to `None`; a missing
    /// environment variable is a configuration error.
    pub fn resolve(&self) -> Result<Option<String>> {
        match self {
            Self::None => Ok(None),
            Self::Inline(password) => Ok(Some(password.clone())),
            Self::Env(var) => std::env::var(var).map(Some).map_err(|_| {
                CopilotError::config(format!("environment variable {var} is not set"))
            }),
            Self::Keyring(key) => {
                let entry = Entry::new(SERVICE_NAME, key).map_err(|e| {
                    CopilotError::config(format!("Failed to access keyring: {e}"))
                })?;
                match entry.get_password() {
                    Ok(secret) => Ok(Some(secret)),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(e) => Err(CopilotError::config(format!(
                        "Failed to retrieve secret: {e}"
                    ))),
                }
            }
        }
    }

    /// Masks a secret for display, showing only the last 4 characters.
    pub fn mask_secret(secret: &str) -> String {
        let chars: Vec<char> = secret.chars().collect();
        if chars.len() <= 4 {
            "*".repeat(chars.len())
        } else {
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("****...{tail}")
        }
    }
}

// Inline secrets must not end up in logs.
impl fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Inline(secret) => write!(f, "Inline({})", Self::mask_secret(secret)),
            Self::Env(var) => write!(f, "Env({var})"),
            Self::Keyring(key) => write!(f, "Keyring({key})"),
        }
    }
}
