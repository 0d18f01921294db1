use thiserror::Error;

use crate::session::ChildCacheName;

/// Failure reported by an [`Evaluator`](crate::session::Evaluator) or a
/// pooled [`Operation`](crate::pool::Operation).
///
/// Evaluation failures are never cached; the next request for the same
/// feature runs the evaluator again.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EvalError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors surfaced by session cache operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The cache was asked to compute before [`init`](crate::session::SessionCache::init)
    /// bound session parameters to it.
    #[error("session cache used before init")]
    Uninitialized,

    /// An identifier did not name any known feature, even after prefix
    /// stripping. Carries the identifier as the caller wrote it.
    #[error("unknown feature identifier `{identifier}`")]
    UnknownFeature { identifier: String },

    /// A child cache name was requested with a different input type than the
    /// one it was created with. The stored child is left untouched.
    #[error("child cache `{name}` already exists with a different input type")]
    ChildCacheTypeMismatch { name: ChildCacheName },

    /// The evaluator failed. Nothing was cached for the feature.
    #[error("evaluation of feature `{feature}` failed")]
    Evaluation {
        feature: String,
        #[source]
        source: EvalError,
    },
}
