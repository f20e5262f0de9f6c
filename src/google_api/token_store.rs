//! OAuth token storage: token.json file backend.
//!
//! The file lives at `~/.attache/google/token.json` and holds a single
//! [`Credential`] in the Python-compatible shape.

use std::fs;
use std::path::PathBuf;

use super::{AuthError, Credential};

/// Path to the token file.
pub fn token_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".attache")
        .join("google")
        .join("token.json")
}

/// Load the stored credential.
pub fn load_token() -> Result<Credential, AuthError> {
    let path = token_path();
    if !path.exists() {
        return Err(AuthError::TokenNotFound(path));
    }
    let content = fs::read_to_string(&path)?;
    let credential: Credential = serde_json::from_str(&content)?;
    Ok(credential)
}

/// Persist a credential, creating the directory on first save.
pub fn save_token(credential: &Credential) -> Result<(), AuthError> {
    let path = token_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(credential)?;
    fs::write(&path, content)?;
    Ok(())
}

/// Remove the stored credential (gmail disconnect).
pub fn delete_token() -> Result<(), AuthError> {
    let path = token_path();
    if path.exists() {
        fs::remove_file(&path)?;
    }
    Ok(())
}

/// Probe for an authenticated account email without propagating errors.
pub fn peek_account_email() -> Option<String> {
    load_token()
        .ok()
        .and_then(|credential| credential.account)
        .filter(|value| !value.trim().is_empty())
}
