//! NewType wrappers for entity identifiers
//!
//! Storage-assigned numeric ids for model entities, plus the string-typed
//! [`ApiId`] used by the task-graph API (string-typed because marker ids are
//! derived by suffixing).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                $name(id)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                $name(id)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a [`Service`](crate::model::Service)
    ServiceId
);
numeric_id!(
    /// Identifier of a [`Node`](crate::model::Node)
    NodeId
);
numeric_id!(
    /// Identifier of a [`Relationship`](crate::model::Relationship)
    RelationshipId
);
numeric_id!(
    /// Identifier of an [`Execution`](crate::model::Execution)
    ExecutionId
);
numeric_id!(
    /// Identifier of an execution-graph [`TaskModel`](crate::model::TaskModel)
    TaskId
);
numeric_id!(
    /// Identifier of a [`ServiceModification`](crate::model::ServiceModification)
    ModificationId
);

// ============================================================================
// API TASK ID
// ============================================================================

/// Suffix appended to a graph id to form its start-marker id
pub const START_MARKER_SUFFIX: &str = "-Start";
/// Suffix appended to a graph id to form its end-marker id
pub const END_MARKER_SUFFIX: &str = "-End";

/// Monotonic counter used to disambiguate generated api ids within a process
static NEXT_API_SEQ: AtomicU64 = AtomicU64::new(0);

/// Strongly-typed identifier of a task in the user-facing task graph
///
/// Guarantees:
/// - Non-empty
/// - Valid characters (alphanumeric, dash, underscore, dot)
/// - Never ends with the reserved marker suffixes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiId(Arc<str>);

impl ApiId {
    /// Create an ApiId with validation
    pub fn new(id: impl AsRef<str>) -> Result<Self, ApiIdError> {
        let id = id.as_ref();

        if id.is_empty() {
            return Err(ApiIdError::Empty);
        }
        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ApiIdError::InvalidCharacters(id.to_string()));
        }
        if id.ends_with(START_MARKER_SUFFIX) || id.ends_with(END_MARKER_SUFFIX) {
            return Err(ApiIdError::ReservedSuffix(id.to_string()));
        }

        Ok(ApiId(Arc::from(id)))
    }

    /// Generate a fresh id from a human-readable name
    ///
    /// The process-wide sequence keeps two tasks built from the same name
    /// distinct while preserving the name for logs.
    pub fn generate(name: &str) -> Self {
        let seq = NEXT_API_SEQ.fetch_add(1, Ordering::Relaxed);
        let sanitized: String = name
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        ApiId(Arc::from(format!("{}.{}", sanitized, seq).as_str()))
    }

    /// The reserved start-marker id of the graph with this id
    pub fn start_marker(&self) -> Self {
        ApiId(Arc::from(format!("{}{}", self.0, START_MARKER_SUFFIX).as_str()))
    }

    /// The reserved end-marker id of the graph with this id
    pub fn end_marker(&self) -> Self {
        ApiId(Arc::from(format!("{}{}", self.0, END_MARKER_SUFFIX).as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for ids carrying a reserved marker suffix
    pub fn is_marker(&self) -> bool {
        self.0.ends_with(START_MARKER_SUFFIX) || self.0.ends_with(END_MARKER_SUFFIX)
    }
}

impl fmt::Display for ApiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ApiId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiIdError {
    #[error("task id cannot be empty")]
    Empty,
    #[error("task id contains invalid characters: {0}")]
    InvalidCharacters(String),
    #[error("task id ends with a reserved marker suffix: {0}")]
    ReservedSuffix(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_id_validation() {
        assert!(ApiId::new("install.web_server-1").is_ok());
        assert!(ApiId::new("").is_err());
        assert!(ApiId::new("has space").is_err());
        assert!(ApiId::new("sneaky-Start").is_err());
        assert!(ApiId::new("sneaky-End").is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = ApiId::generate("create");
        let b = ApiId::generate("create");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("create."));
    }

    #[test]
    fn marker_ids_round_trip() {
        let id = ApiId::new("wf").unwrap();
        assert_eq!(id.start_marker().as_str(), "wf-Start");
        assert_eq!(id.end_marker().as_str(), "wf-End");
        assert!(id.start_marker().is_marker());
        assert!(!id.is_marker());
    }

    #[test]
    fn numeric_ids_display_and_convert() {
        let id = NodeId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(NodeId::from(42), id);
        assert_eq!(id.get(), 42);
    }
}
