//! Limit rules and key matching.
//!
//! Rules pair a key glob with a limit per time unit. Keys are matched against
//! rules in order and the first match wins, so specific patterns belong
//! before broad ones:
//!
//! ```yaml
//! rules:
//!   - name: login
//!     pattern: "api:login:*"
//!     requests_per_unit: 5
//!     unit: minute
//!   - name: api
//!     pattern: "api:*"
//!     requests_per_unit: 1000
//!     unit: minute
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::store::glob::Pattern;

/// Time unit for a limit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A limit applied to every key matching `pattern`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRule {
    /// Optional name/description for this limit
    #[serde(default)]
    pub name: Option<String>,
    /// Keys this rule applies to
    pub pattern: Pattern,
    /// Units admitted per window; zero or less blocks matching keys
    pub requests_per_unit: i64,
    /// The window length
    pub unit: TimeUnit,
}

impl LimitRule {
    pub fn new(pattern: &str, requests_per_unit: i64, unit: TimeUnit) -> Result<Self> {
        Ok(Self {
            name: None,
            pattern: Pattern::new(pattern)?,
            requests_per_unit,
            unit,
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn window(&self) -> Duration {
        self.unit.duration()
    }

    /// Label for logs: the name if set, else the pattern.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(self.pattern.as_str())
    }
}

/// An ordered set of limit rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub rules: Vec<LimitRule>,
}

impl RulesConfig {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: Vec<LimitRule>) -> Self {
        Self { rules }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // First, try a bare list of rules
        if let Ok(rules) = serde_yaml::from_str::<Vec<LimitRule>>(yaml) {
            return Ok(Self { rules });
        }

        // Otherwise, expect a document with a `rules` key
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Find the first rule whose pattern matches `key`.
    pub fn find_limit(&self, key: &str) -> Option<&LimitRule> {
        self.rules.iter().find(|rule| rule.pattern.matches(key))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
