//! Topic access control
//!
//! Evaluates an ACL file of per-user and default rules. Permissions are
//! FULL, READ or WRITE; the publish path checks WRITE and the subscribe
//! path checks READ. READ rules accept only concrete topics and wildcard
//! filters without `+` and with at most a trailing `#`.
//!
//! File format:
//!
//! ```text
//! # default rules, applied to every user including anonymous
//! topic read $SYS/#
//! topic sensors/#
//!
//! # per-user rules
//! user alice
//! topic write commands/alice
//! ```
//!
//! A bare `topic <pattern>` grants FULL access.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use crate::hooks::{HookResult, Hooks};
use crate::topic::topic_matches_filter;


/// Access requested for a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Permission granted by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permission {
    Full,
    Read,
    Write,
}

impl Permission {
    fn allows(self, access: Access) -> bool {
        match self {
            Permission::Full => true,
            Permission::Read => access == Access::Read,
            Permission::Write => access == Access::Write,
        }
    }
}

#[derive(Debug, Clone)]
struct AclRule {
    pattern: String,
    permission: Permission,
}

/// ACL parse error
#[derive(Debug)]
pub enum AclError {
    Io(std::io::Error),
    /// Line number and reason
    Parse(usize, &'static str),
}

impl std::fmt::Display for AclError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AclError::Io(e) => write!(f, "IO error: {}", e),
            AclError::Parse(line, msg) => write!(f, "ACL line {}: {}", line, msg),
        }
    }
}

impl std::error::Error for AclError {}

impl From<std::io::Error> for AclError {
    fn from(e: std::io::Error) -> Self {
        AclError::Io(e)
    }
}

/// ACL provider
pub struct AclProvider {
    enabled: bool,
    default_rules: Vec<AclRule>,
    user_rules: HashMap<String, Vec<AclRule>>,
}

/// Does a READ rule's pattern cover the requested filter? The pattern is
/// either concrete (exact match) or `prefix/#` (any filter under the
/// prefix, including the prefix itself).
fn read_rule_covers(pattern: &str, filter: &str) -> bool {
    if pattern == "#" {
        return true;
    }
    match pattern.strip_suffix("/#") {
        Some(base) => {
            filter == base
                || filter
                    .strip_prefix(base)
                    .is_some_and(|rest| rest.starts_with('/'))
                || filter == pattern
        }
        None => filter == pattern,
    }
}

/// READ rules accept only concrete topics and filters without `+` whose
/// only wildcard is a trailing `#`.
fn valid_read_pattern(pattern: &str) -> bool {
    if pattern.contains('+') {
        return false;
    }
    match pattern.find('#') {
        None => true,
        Some(pos) => {
            pos == pattern.len() - 1 && (pattern == "#" || pattern.as_bytes()[pos - 1] == b'/')
        }
    }
}

impl AclProvider {
    /// Build a provider with no ACL file: every operation is allowed.
    pub fn open() -> Self {
        Self {
            enabled: false,
            default_rules: Vec::new(),
            user_rules: HashMap::new(),
        }
    }

    /// Load an ACL file.
    pub fn from_acl_file(path: &Path) -> Result<Self, AclError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self, AclError> {
        let mut default_rules = Vec::new();
        let mut user_rules: HashMap<String, Vec<AclRule>> = HashMap::new();
        let mut current_user: Option<String> = None;

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(user) = line.strip_prefix("user ") {
                current_user = Some(user.trim().to_string());
                continue;
            }

            let Some(rest) = line.strip_prefix("topic ") else {
                return Err(AclError::Parse(lineno + 1, "expected 'topic' or 'user'"));
            };
            let rest = rest.trim();
            let (permission, pattern) = if let Some(p) = rest.strip_prefix("read ") {
                (Permission::Read, p.trim())
            } else if let Some(p) = rest.strip_prefix("write ") {
                (Permission::Write, p.trim())
            } else {
                (Permission::Full, rest)
            };

            if pattern.is_empty() {
                return Err(AclError::Parse(lineno + 1, "empty topic pattern"));
            }
            if matches!(permission, Permission::Read | Permission::Full)
                && !valid_read_pattern(pattern)
            {
                return Err(AclError::Parse(
                    lineno + 1,
                    "read rules accept only a trailing # wildcard",
                ));
            }

            let rule = AclRule {
                pattern: pattern.to_string(),
                permission,
            };
            match &current_user {
                Some(user) => user_rules.entry(user.clone()).or_default().push(rule),
                None => default_rules.push(rule),
            }
        }

        Ok(Self {
            enabled: true,
            default_rules,
            user_rules,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Allow/deny one access. An unauthenticated user is matched against
    /// the default rules only. WRITE checks match the concrete topic
    /// against the rule pattern; READ checks test whether the rule covers
    /// the requested filter, which the restricted READ pattern syntax
    /// makes a prefix comparison.
    pub fn check(&self, username: Option<&str>, topic: &str, access: Access) -> bool {
        if !self.enabled {
            return true;
        }

        let rules = username
            .and_then(|u| self.user_rules.get(u))
            .into_iter()
            .flatten()
            .chain(self.default_rules.iter());

        for rule in rules {
            if !rule.permission.allows(access) {
                continue;
            }
            let matched = match access {
                Access::Write => topic_matches_filter(topic, &rule.pattern),
                Access::Read => read_rule_covers(&rule.pattern, topic),
            };
            if matched {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl Hooks for AclProvider {
    async fn on_publish_check(
        &self,
        _client_id: &str,
        username: Option<&str>,
        topic: &str,
    ) -> HookResult<bool> {
        Ok(self.check(username, topic, Access::Write))
    }

    async fn on_subscribe_check(
        &self,
        _client_id: &str,
        username: Option<&str>,
        filter: &str,
    ) -> HookResult<bool> {
        Ok(self.check(username, filter, Access::Read))
    }
}
