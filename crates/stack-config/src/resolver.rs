//! Environment variable substitution
//!
//! Values may reference `${VAR}` or `${VAR:-default}`. Lookups go to the
//! context first and then to the process environment.

use crate::{ConfigError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static VAR_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").ok());

/// Variables available during substitution
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    /// Values taking precedence over the process environment
    pub env_vars: BTreeMap<String, String>,
    /// Whether the process environment is consulted
    pub use_process_env: bool,
}

impl ResolutionContext {
    /// Context backed by the process environment
    pub fn new() -> Self {
        Self {
            env_vars: BTreeMap::new(),
            use_process_env: true,
        }
    }

    /// Context that only sees explicitly set variables
    pub fn isolated() -> Self {
        Self::default()
    }

    /// Add or update a variable
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env_vars.insert(key.into(), value.into());
    }

    fn lookup(&self, name: &str) -> Option<String> {
        self.env_vars.get(name).cloned().or_else(|| {
            self.use_process_env
                .then(|| std::env::var(name).ok())
                .flatten()
        })
    }
}

/// Substitute every variable reference in `input`
pub fn resolve_string(input: &str, context: &ResolutionContext) -> Result<String> {
    let Some(re) = VAR_PATTERN.as_ref() else {
        return Ok(input.to_string());
    };

    let mut missing = Vec::new();
    let resolved = re.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match (context.lookup(name), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }
    Ok(resolved.into_owned())
}

/// Substitute every value of an environment map
pub fn resolve_env(
    env: &BTreeMap<String, String>,
    context: &ResolutionContext,
) -> Result<BTreeMap<String, String>> {
    env.iter()
        .map(|(key, value)| Ok((key.clone(), resolve_string(value, context)?)))
        .collect()
}
