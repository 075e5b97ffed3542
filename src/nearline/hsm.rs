//! HSM backend definitions and removal command construction
//!
//! Each nearline location is a URI whose scheme names the HSM type and whose
//! authority names the HSM instance, e.g. `osm://tape-a/0001/0042`. A
//! backend is configured with free-form attributes, one of which is the
//! `command` to invoke.

use crate::nearline::remove::RemovalError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute naming the executable of a backend
pub const COMMAND_ATTRIBUTE: &str = "command";

/// One configured HSM backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmConfig {
    pub instance: String,
    #[serde(rename = "type")]
    pub hsm_type: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl HsmConfig {
    pub fn new(instance: impl Into<String>, hsm_type: impl Into<String>) -> Self {
        HsmConfig {
            instance: instance.into(),
            hsm_type: hsm_type.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn command(&self) -> Option<&str> {
        self.attributes
            .get(COMMAND_ATTRIBUTE)
            .map(String::as_str)
            .filter(|c| !c.trim().is_empty())
    }
}

/// Scheme and authority of a nearline location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsmLocation<'a> {
    pub scheme: &'a str,
    pub authority: &'a str,
}

impl<'a> HsmLocation<'a> {
    /// Split `scheme://authority/...`; `None` if either part is missing
    pub fn parse(uri: &'a str) -> Option<Self> {
        let (scheme, rest) = uri.split_once("://")?;
        let valid_scheme = scheme
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme {
            return None;
        }
        let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let authority = &rest[..end];
        if authority.is_empty() {
            return None;
        }
        Some(HsmLocation { scheme, authority })
    }
}

/// The set of backends known to a pool
#[derive(Debug, Clone, Default)]
pub struct HsmSet {
    backends: Vec<HsmConfig>,
}

impl HsmSet {
    pub fn new(backends: Vec<HsmConfig>) -> Self {
        HsmSet { backends }
    }

    pub fn find(&self, hsm_type: &str, instance: &str) -> Option<&HsmConfig> {
        self.backends
            .iter()
            .find(|b| b.hsm_type == hsm_type && b.instance == instance)
    }

    /// Backend responsible for a nearline location
    pub fn resolve(&self, uri: &str) -> Result<&HsmConfig, RemovalError> {
        let location = HsmLocation::parse(uri)
            .ok_or_else(|| RemovalError::Configuration(format!("malformed location {}", uri)))?;
        self.find(location.scheme, location.authority).ok_or_else(|| {
            RemovalError::Configuration(format!(
                "no HSM of type {} named {} configured",
                location.scheme, location.authority
            ))
        })
    }

    /// `<command> remove -uri=<uri> -<attr>=<value> ...`
    ///
    /// Attributes appear in key order; one with an empty value is passed as
    /// a bare `-<attr>` switch.
    pub fn build_remove_command(&self, uri: &str) -> Result<String, RemovalError> {
        let backend = self.resolve(uri)?;
        let command = backend.command().ok_or_else(|| {
            RemovalError::Configuration(format!(
                "HSM {} of type {} has no {} attribute",
                backend.instance, backend.hsm_type, COMMAND_ATTRIBUTE
            ))
        })?;

        let mut line = format!("{} remove -uri={}", command, uri);
        for (key, value) in &backend.attributes {
            line.push_str(" -");
            line.push_str(key);
            if !value.is_empty() {
                line.push('=');
                line.push_str(value);
            }
        }
        Ok(line)
    }
}
