//! Line-oriented `.properties` parsing.
//!
//! ```text
//! # peers, one entry per node
//! clients=alpha,beta:4600
//! servers=alpha:4500,beta:4500
//! password=hunter2
//! ```
//!
//! `key=value` per line; blank lines and lines starting with `#` are
//! skipped. Values keep everything after the first `=`, trimmed.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

/// Parsed properties file.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    /// Loads and parses a properties file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read properties file {}", path.display()))?;
        Self::parse(&text)
    }

    /// Parses properties text. Later duplicate keys win.
    pub fn parse(text: &str) -> Result<Self> {
        let mut values = HashMap::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .with_context(|| format!("line {}: expected key=value", number + 1))?;
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { values })
    }

    /// Returns a property value, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns a property value, failing if missing or empty.
    pub fn require(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => anyhow::bail!("property {key:?} must be set in the properties file"),
        }
    }
}
