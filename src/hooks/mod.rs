//! Hooks
//!
//! Extension points for authentication and authorization. The protocol
//! state machines only ever see the boolean answers; credential storage
//! and rule evaluation live behind this trait.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Broker hooks trait
///
/// All methods default to allowing everything.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called when a client attempts to connect.
    /// `Ok(false)` refuses the connection with bad-username-or-password.
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// WRITE check: called for every inbound publish.
    async fn on_publish_check(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _topic: &str,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// READ check: called for every subscription filter.
    async fn on_subscribe_check(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _filter: &str,
    ) -> HookResult<bool> {
        Ok(true)
    }
}

/// Hooks that allow everything
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

/// Chain of hooks: every link must allow an operation
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Arc<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn with(mut self, hook: Arc<dyn Hooks>) -> Self {
        self.hooks.push(hook);
        self
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        for hook in &self.hooks {
            if !hook.on_authenticate(client_id, username, password).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_publish_check(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
    ) -> HookResult<bool> {
        for hook in &self.hooks {
            if !hook.on_publish_check(client_id, username, topic).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_subscribe_check(
        &self,
        client_id: &str,
        username: Option<&str>,
        filter: &str,
    ) -> HookResult<bool> {
        for hook in &self.hooks {
            if !hook.on_subscribe_check(client_id, username, filter).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
