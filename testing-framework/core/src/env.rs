//! Publication of discovered endpoints into the process environment.
//!
//! Later verification steps read `<service>_host` / `<service>_<port>` style
//! keys, so every value lands in the real process environment. The broker
//! additionally keeps a record of what it published for logging and tests.

use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing::{debug, info};

/// Failures while publishing environment state.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("invalid environment key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("invalid value for environment key '{key}': contains a NUL byte")]
    InvalidValue { key: String },
    #[error("failed to read environment profile {path}: {source}")]
    ProfileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed line {line} in environment profile {path}: '{content}'")]
    ProfileSyntax {
        path: PathBuf,
        line: usize,
        content: String,
    },
}

/// Writes keys into the process environment, last write wins.
#[derive(Clone, Debug, Default)]
pub struct EnvironmentVariableBroker {
    published: Arc<Mutex<BTreeMap<String, String>>>,
}

impl EnvironmentVariableBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value` for the rest of the process.
    pub fn publish(&self, key: &str, value: &str) -> Result<(), EnvError> {
        validate_key(key)?;
        if value.contains('\0') {
            return Err(EnvError::InvalidValue {
                key: key.to_owned(),
            });
        }

        // SAFETY: keys are published by the setup phase before verification
        // steps read them, and the key/value were checked for `=` and NUL.
        unsafe {
            env::set_var(key, value);
        }

        if let Ok(mut published) = self.published.lock() {
            published.insert(key.to_owned(), value.to_owned());
        }
        debug!(key, value, "exported environment variable");
        Ok(())
    }

    /// Publish every `KEY=VALUE` line of a profile file.
    pub fn export_profile(&self, path: &Path) -> Result<usize, EnvError> {
        let raw = fs::read_to_string(path).map_err(|source| EnvError::ProfileRead {
            path: path.to_path_buf(),
            source,
        })?;

        let mut exported = 0;
        for (index, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
            let Some((key, value)) = line.split_once('=') else {
                return Err(EnvError::ProfileSyntax {
                    path: path.to_path_buf(),
                    line: index + 1,
                    content: line.to_owned(),
                });
            };
            self.publish(key.trim(), unquote(value.trim()))?;
            exported += 1;
        }

        info!(path = %path.display(), exported, "environment profile exported");
        Ok(exported)
    }

    /// Snapshot of every key published through this broker.
    #[must_use]
    pub fn published(&self) -> BTreeMap<String, String> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }
}

/// Replace `/` and `-` so a resource name is usable as a variable prefix.
#[must_use]
pub fn sanitize_resource_name(resource: &str) -> String {
    resource.replace(['/', '-'], "_")
}

#[must_use]
pub fn host_key(prefix: &str) -> String {
    format!("{prefix}_host")
}

#[must_use]
pub fn port_key(prefix: &str, port: impl std::fmt::Display) -> String {
    format!("{prefix}_{port}")
}

/// Expand `$VAR` and `${VAR}` references against the process environment.
/// Unset variables expand to the empty string.
#[must_use]
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let name: String = chars.by_ref().take_while(|c| *c != '}').collect();
                out.push_str(&env::var(&name).unwrap_or_default());
            }
            Some(c) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }

    out
}

fn validate_key(key: &str) -> Result<(), EnvError> {
    let reason = if key.is_empty() {
        "key is empty"
    } else if key.contains('=') {
        "key contains '='"
    } else if key.contains('\0') {
        "key contains a NUL byte"
    } else {
        return Ok(());
    };
    Err(EnvError::InvalidKey {
        key: key.to_owned(),
        reason,
    })
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
