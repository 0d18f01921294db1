//! Session parameters shared across a cache hierarchy.
//!
//! Parameters describe the unit of work a session is scoped to (image,
//! record, batch element). They are bound once by
//! [`SessionCache::init`](crate::session::SessionCache::init) and shared with
//! every child cache, so evaluators at any nesting level see the same
//! configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One configuration value.
///
/// `untagged` deserialization tries variants in declaration order, so JSON
/// booleans become flags and JSON numbers become numbers before anything is
/// treated as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Errors from loading parameters.
#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("failed to read parameters file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse parameters JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Immutable bag of session parameters.
///
/// Mutating methods exist for building the bag; once it is handed to
/// `init` (behind an `Rc`) it is effectively frozen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Label identifying the unit of work; shows up in spans and reports.
    #[serde(default)]
    pub label: Option<String>,

    /// Free-form key/value parameters available to evaluators.
    #[serde(default)]
    pub values: BTreeMap<String, ParamValue>,
}

impl SessionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            ParamValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.values.get(key)? {
            ParamValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ParamsError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ParamsError> {
        let text = fs::read_to_string(path).map_err(|source| {
            tracing::warn!(
                target: "prism.params",
                path = %path.display(),
                error = ?source,
                "failed to read parameters file"
            );
            ParamsError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_reads_typed_values() {
        let mut params = SessionParams::with_label("case-17");
        params.set("bin_width", 25.0);
        params.set("normalize", true);
        params.set("interpolation", "linear");

        assert_eq!(params.label.as_deref(), Some("case-17"));
        assert_eq!(params.number("bin_width"), Some(25.0));
        assert_eq!(params.flag("normalize"), Some(true));
        assert_eq!(params.text("interpolation"), Some("linear"));
        // Typed getters do not coerce across kinds.
        assert_eq!(params.number("interpolation"), None);
        assert_eq!(params.text("bin_width"), None);
    }

    #[test]
    fn parses_json_with_untagged_values() {
        let params = SessionParams::from_json_str(
            r#"{
                "label": "scan-003",
                "values": {
                    "bin_width": 25.0,
                    "normalize": false,
                    "kernel": "gauss"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(params.label.as_deref(), Some("scan-003"));
        assert_eq!(params.number("bin_width"), Some(25.0));
        assert_eq!(params.flag("normalize"), Some(false));
        assert_eq!(params.text("kernel"), Some("gauss"));
    }

    #[test]
    fn missing_fields_default() {
        let params = SessionParams::from_json_str("{}").unwrap();
        assert_eq!(params, SessionParams::new());
    }

    #[test]
    fn json_round_trips() {
        let mut params = SessionParams::with_label("roundtrip");
        params.set("sigma", 1.5);
        params.set("mirror", true);
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(SessionParams::from_json_str(&json).unwrap(), params);
    }

    #[test]
    fn loads_params_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");

        let mut params = SessionParams::with_label("from-disk");
        params.set("bins", 32.0);
        fs::write(&path, serde_json::to_string(&params).unwrap()).unwrap();

        assert_eq!(SessionParams::from_json_file(&path).unwrap(), params);
    }

    #[test]
    fn missing_params_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");

        let err = SessionParams::from_json_file(&path).unwrap_err();
        match err {
            ParamsError::Io { path: reported, source } => {
                assert_eq!(reported, path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected ParamsError::Io, got {other:?}"),
        }
    }

    #[test]
    fn malformed_params_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        fs::write(&path, "{ not json").unwrap();

        let err = SessionParams::from_json_file(&path).unwrap_err();
        assert!(matches!(err, ParamsError::Parse(_)), "got {err:?}");
    }
}
