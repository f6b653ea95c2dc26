//! Build manifest parsing and validation.
//!
//! The manifest is a small YAML document (`quay.yaml`) at the application
//! repository root. Validation is strict: every key is checked against a
//! closed descriptor table and anything outside it rejects the manifest, so
//! an operator typo never gets silently ignored.

use std::collections::BTreeMap;

use serde_yaml::Value;
use thiserror::Error;

use super::model::Manifest;

pub const MANIFEST_FILE: &str = "quay.yaml";

pub const DEFAULT_APP_PORT: u16 = 80;

/// Supported runtimes and the base image each one resolves to.
pub const RUNTIMES: &[(&str, &str)] = &[
    ("python3.8", "python:3.8-slim"),
    ("python3.9", "python:3.9-slim"),
    ("python3.10", "python:3.10-slim"),
    ("python3.11", "python:3.11-slim"),
    ("node18", "node:18-slim"),
    ("node20", "node:20-slim"),
];

pub fn base_image(runtime: &str) -> Option<&'static str> {
    RUNTIMES
        .iter()
        .find(|(name, _)| *name == runtime)
        .map(|(_, image)| *image)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("manifest is not valid YAML: {0}")]
    Syntax(String),

    #[error("manifest root must be a mapping")]
    NotAMapping,

    #[error("missing required key `{0}`")]
    MissingKey(&'static str),

    #[error("key `{key}` must be {expected}")]
    InvalidType {
        key: &'static str,
        expected: &'static str,
    },

    #[error("unknown key `{0}`")]
    UnknownKey(String),

    #[error("unsupported runtime `{0}`")]
    UnsupportedRuntime(String),
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Str,
    /// A shell command, or an ordered sequence of them.
    Steps,
    StrMap,
    Port,
}

impl Kind {
    fn expected(self) -> &'static str {
        match self {
            Kind::Str => "a string",
            Kind::Steps => "a string or a sequence of strings",
            Kind::StrMap => "a mapping of strings to strings",
            Kind::Port => "an integer port number",
        }
    }
}

struct Field {
    name: &'static str,
    kind: Kind,
    required: bool,
}

/// Recognized manifest keys. New keys are added here, not by branching code.
const FIELDS: &[Field] = &[
    Field { name: "runtime", kind: Kind::Str, required: true },
    Field { name: "web", kind: Kind::Steps, required: true },
    Field { name: "run", kind: Kind::Steps, required: false },
    Field { name: "env", kind: Kind::StrMap, required: false },
    Field { name: "port", kind: Kind::Port, required: false },
];

/// A present value coerced to its declared shape.
enum FieldValue {
    Str(String),
    Steps(Vec<String>),
    StrMap(BTreeMap<String, String>),
    Port(u16),
}

fn coerce(field: &Field, value: &Value) -> Result<FieldValue, ValidationError> {
    let invalid = || ValidationError::InvalidType {
        key: field.name,
        expected: field.kind.expected(),
    };
    match field.kind {
        Kind::Str => value
            .as_str()
            .map(|s| FieldValue::Str(s.to_string()))
            .ok_or_else(invalid),
        Kind::Steps => match value {
            Value::String(s) => Ok(FieldValue::Steps(vec![s.clone()])),
            Value::Sequence(items) => items
                .iter()
                .map(|item| item.as_str().map(String::from).ok_or_else(invalid))
                .collect::<Result<Vec<_>, _>>()
                .map(FieldValue::Steps),
            _ => Err(invalid()),
        },
        Kind::StrMap => match value {
            Value::Mapping(entries) => entries
                .iter()
                .map(|(k, v)| match (k.as_str(), v.as_str()) {
                    (Some(k), Some(v)) => Ok((k.to_string(), v.to_string())),
                    _ => Err(invalid()),
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(FieldValue::StrMap),
            _ => Err(invalid()),
        },
        Kind::Port => value
            .as_u64()
            .and_then(|port| u16::try_from(port).ok())
            .map(FieldValue::Port)
            .ok_or_else(invalid),
    }
}

/// Parse and validate raw manifest text into a normalized [`Manifest`].
pub fn parse(text: &str) -> Result<Manifest, ValidationError> {
    let raw: Value =
        serde_yaml::from_str(text).map_err(|e| ValidationError::Syntax(e.to_string()))?;
    validate(&raw)
}

/// Validate a parsed manifest document. Pure transform, no side effects.
pub fn validate(raw: &Value) -> Result<Manifest, ValidationError> {
    let mapping = raw.as_mapping().ok_or(ValidationError::NotAMapping)?;

    for key in mapping.keys() {
        let name = key
            .as_str()
            .ok_or_else(|| ValidationError::UnknownKey(format!("{key:?}")))?;
        if !FIELDS.iter().any(|field| field.name == name) {
            return Err(ValidationError::UnknownKey(name.to_string()));
        }
    }

    let mut runtime = None;
    let mut web = None;
    let mut run = Vec::new();
    let mut env = BTreeMap::new();
    let mut port = DEFAULT_APP_PORT;

    for field in FIELDS {
        let value = match mapping.get(field.name) {
            Some(value) => coerce(field, value)?,
            None if field.required => return Err(ValidationError::MissingKey(field.name)),
            None => continue,
        };
        match (field.name, value) {
            ("runtime", FieldValue::Str(s)) => runtime = Some(s),
            ("web", FieldValue::Steps(steps)) => web = Some(steps),
            ("run", FieldValue::Steps(steps)) => run = steps,
            ("env", FieldValue::StrMap(map)) => env = map,
            ("port", FieldValue::Port(p)) => port = p,
            _ => unreachable!("descriptor table and coercion disagree"),
        }
    }

    let runtime = runtime.ok_or(ValidationError::MissingKey("runtime"))?;
    let base_image = base_image(&runtime)
        .ok_or_else(|| ValidationError::UnsupportedRuntime(runtime.clone()))?
        .to_string();
    let web = web.ok_or(ValidationError::MissingKey("web"))?;

    Ok(Manifest {
        base_image,
        web,
        run,
        env,
        port,
    })
}
