//! Authentication
//!
//! Username/password verification against a password file of
//! `username:password` lines. Credential storage is plaintext, matching
//! the password-file format the broker has always shipped with.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use crate::hooks::{HookResult, Hooks};

#[cfg(test)]
mod tests;

/// Authentication provider
pub struct AuthProvider {
    /// Whether a password file is configured
    enabled: bool,
    /// Allow connections that carry no username
    allow_anonymous: bool,
    /// username -> password
    users: HashMap<String, String>,
}

impl AuthProvider {
    /// Build a provider with no password file: every connection is
    /// accepted.
    pub fn open() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: HashMap::new(),
        }
    }

    /// Load a password file of `username:password` lines. Blank lines and
    /// lines starting with `#` are skipped.
    pub fn from_password_file(
        path: &Path,
        allow_anonymous: bool,
    ) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        let mut users = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((username, password)) = line.split_once(':') {
                users.insert(username.to_string(), password.to_string());
            }
        }
        Ok(Self {
            enabled: true,
            allow_anonymous,
            users,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn verify(&self, username: &str, password: Option<&[u8]>) -> bool {
        match (self.users.get(username), password) {
            (Some(stored), Some(given)) => stored.as_bytes() == given,
            _ => false,
        }
    }
}

#[async_trait]
impl Hooks for AuthProvider {
    async fn on_authenticate(
        &self,
        _client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        if !self.enabled {
            return Ok(true);
        }
        match username {
            Some(username) => Ok(self.verify(username, password)),
            None => Ok(self.allow_anonymous),
        }
    }
}
