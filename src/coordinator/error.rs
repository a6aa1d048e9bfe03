use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error accepted from fetch producers.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failure of a scheduled fetch.
///
/// Cloneable so every caller joined onto the same request receives it.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("fetch for `{key}` failed: {source}")]
    Producer {
        key: String,
        source: Arc<dyn StdError + Send + Sync + 'static>,
    },
    #[error("request for `{key}` resolved with a value of a different type")]
    TypeMismatch { key: String },
    #[error("fetch for `{key}` aborted: {message}")]
    Aborted { key: String, message: String },
    /// The key was fetched successfully within its throttle window; the
    /// producer did not run. Callers answer from their cached copy.
    #[error("fetch for `{key}` throttled for another {remaining:?}")]
    Throttled { key: String, remaining: Duration },
}

impl FetchError {
    pub(crate) fn producer(key: &str, source: impl Into<BoxError>) -> Self {
        Self::Producer {
            key: key.to_string(),
            source: Arc::from(source.into()),
        }
    }

    pub(crate) fn aborted(key: &str, message: impl Into<String>) -> Self {
        Self::Aborted {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn throttled(key: &str, remaining: Duration) -> Self {
        Self::Throttled {
            key: key.to_string(),
            remaining,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Producer { key, .. }
            | Self::TypeMismatch { key }
            | Self::Aborted { key, .. }
            | Self::Throttled { key, .. } => key,
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// The producer's own error, unchanged.
    pub fn source_ref(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Producer { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    pub fn downcast_source<E: StdError + 'static>(&self) -> Option<&E> {
        self.source_ref().and_then(|source| source.downcast_ref::<E>())
    }
}
