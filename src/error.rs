use std::fmt;

use crate::registry::{ComponentKind, ResourceKind};

/// Errors raised while validating or constructing a stream, always before any stage runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unrecognised {kind} type '{name}'")]
    UnknownComponent { kind: ComponentKind, name: String },

    #[error("{kind} '{name}' is already registered")]
    DuplicateComponent { kind: ComponentKind, name: String },

    #[error("{component}: unknown field '{field}'")]
    UnknownField { component: String, field: String },

    #[error("{component}: missing required field '{field}'")]
    MissingField { component: String, field: String },

    #[error("{component}: field '{field}' expected {expected}, found {found}")]
    InvalidType {
        component: String,
        field: String,
        expected: String,
        found: String,
    },

    #[error("{component}: field '{field}' value {value} outside range [{}, {}]", fmt_bound(.min), fmt_bound(.max))]
    OutOfRange {
        component: String,
        field: String,
        value: f64,
        min: Option<f64>,
        max: Option<f64>,
    },

    #[error("{component}: field '{field}' value '{value}' is not one of {options:?}")]
    InvalidOption {
        component: String,
        field: String,
        value: String,
        options: Vec<String>,
    },

    #[error("{component}: field '{field}' references unknown {kind} resource '{name}'")]
    UnknownResource {
        component: String,
        field: String,
        kind: ResourceKind,
        name: String,
    },

    #[error("failed to construct {kind} '{name}': {source}")]
    Construction {
        kind: ComponentKind,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("{0}")]
    Expression(String),

    #[error("invalid stream config: {0}")]
    Invalid(String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_bound(bound: &Option<f64>) -> String {
    match bound {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

/// Errors from the resource manager.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("{kind} resource '{name}' not found")]
    Unknown { kind: ResourceKind, name: String },

    #[error("{kind} resource '{name}' is already declared")]
    Duplicate { kind: ResourceKind, name: String },

    #[error("resource '{name}' has been closed")]
    Closed { name: String },
}

/// Outcome of a source read that did not produce a transaction.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("end of input")]
    EndOfInput,

    #[error("transient read error: {0}")]
    Transient(anyhow::Error),

    #[error("fatal read error: {0}")]
    Fatal(anyhow::Error),
}

/// Failure reported by a sink write.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("transient write error: {0}")]
    Transient(anyhow::Error),

    #[error("fatal write error: {0}")]
    Fatal(anyhow::Error),

    #[error(transparent)]
    Partial(BatchError),
}

impl WriteError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, WriteError::Fatal(_))
    }
}

/// Per-message failures within an otherwise delivered batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchError {
    failed: Vec<(usize, String)>,
}

impl BatchError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag the message at `index` as failed.
    pub fn fail(mut self, index: usize, reason: impl Into<String>) -> Self {
        self.failed.push((index, reason.into()));
        self
    }

    pub fn failed(&self) -> &[(usize, String)] {
        &self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} message(s) failed", self.failed.len())?;
        if let Some((index, reason)) = self.failed.first() {
            write!(f, ", first at index {index}: {reason}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

/// Errors surfaced by a running stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("stage '{stage}' failed to connect: {source}")]
    Connect {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("stage '{stage}' hit an unrecoverable error: {source}")]
    Fatal {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("stage '{stage}' panicked")]
    TaskPanicked { stage: String },
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;
