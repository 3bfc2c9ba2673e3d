//! Retryable-error classification.
//!
//! Many control plane failures are capacity or propagation races that clear
//! up on their own. The known ones live in a versioned pattern table
//! (`data/transient_errors.yaml`) so they can change without touching any
//! call site. Everything not in the table is fatal.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The built-in pattern table, compiled into the binary
pub const BUILTIN_TABLE_YAML: &str = include_str!("../../data/transient_errors.yaml");

/// One transient-error rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransientPattern {
    /// Regular expression over the error text (unanchored)
    pub pattern: String,

    /// Human-readable reason reported when the rule matches
    pub reason: String,
}

impl TransientPattern {
    pub fn new(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }
}

/// Ordered, versioned set of transient-error rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternTable {
    pub version: u32,

    #[serde(default)]
    pub patterns: Vec<TransientPattern>,
}

impl PatternTable {
    /// Parse a table from YAML
    pub fn from_yaml(content: &str) -> Result<Self, ClassifierError> {
        serde_yaml::from_str(content).map_err(|e| ClassifierError::Table(e.to_string()))
    }

    /// The table shipped with the crate
    pub fn builtin() -> Result<Self, ClassifierError> {
        Self::from_yaml(BUILTIN_TABLE_YAML)
    }

    /// Append rules after the existing ones (existing rules keep priority)
    pub fn extend(&mut self, extra: impl IntoIterator<Item = TransientPattern>) {
        self.patterns.extend(extra);
    }
}

/// Classifier errors
#[derive(Debug, Clone, Error)]
pub enum ClassifierError {
    #[error("Invalid transient-error table: {0}")]
    Table(String),

    #[error("Invalid transient-error pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },
}

/// Verdict for a single error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Expected to clear up if the call is simply retried
    Transient { reason: String },

    /// Propagate immediately
    Fatal,
}

impl Classification {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { reason } => write!(f, "transient ({})", reason),
            Self::Fatal => f.write_str("fatal"),
        }
    }
}

/// Compiled pattern table
#[derive(Debug, Clone)]
pub struct RetryClassifier {
    version: u32,
    rules: Vec<(Regex, String)>,
}

impl RetryClassifier {
    /// Compile a table; an invalid regex rejects the whole table
    pub fn compile(table: &PatternTable) -> Result<Self, ClassifierError> {
        let rules = table
            .patterns
            .iter()
            .map(|p| {
                Regex::new(&p.pattern)
                    .map(|re| (re, p.reason.clone()))
                    .map_err(|e| ClassifierError::Pattern {
                        pattern: p.pattern.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            version: table.version,
            rules,
        })
    }

    /// Compile the built-in table
    pub fn builtin() -> Result<Self, ClassifierError> {
        Self::compile(&PatternTable::builtin()?)
    }

    /// A classifier that treats every error as fatal
    pub fn fail_closed() -> Self {
        Self {
            version: 0,
            rules: Vec::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Classify an error message; first matching rule wins
    pub fn classify(&self, message: &str) -> Classification {
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(message))
            .map(|(_, reason)| Classification::Transient {
                reason: reason.clone(),
            })
            .unwrap_or(Classification::Fatal)
    }

    /// Classify any displayable error by its text
    pub fn classify_error<E: fmt::Display + ?Sized>(&self, error: &E) -> Classification {
        self.classify(&error.to_string())
    }
}
