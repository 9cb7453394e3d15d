//! Failure classification for retry decisions.

use std::collections::HashMap;

use forgebatch_core::BatchError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Classification {
    Retryable,
    Fatal,
}

/// Maps a failure to retryable or fatal.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, error: &BatchError) -> Classification;
}

impl<F> FailureClassifier for F
where
    F: Fn(&BatchError) -> Classification + Send + Sync,
{
    fn classify(&self, error: &BatchError) -> Classification {
        self(error)
    }
}

/// Classifies by [`BatchError::kind`], falling back to an explicit default.
///
/// The default is [`Classification::Fatal`]: anything not listed is not
/// retried. Fatal and interruption failures are never retryable, whatever
/// the table says.
#[derive(Debug, Clone)]
pub struct BinaryFailureClassifier {
    kinds: HashMap<String, Classification>,
    default: Classification,
}

impl Default for BinaryFailureClassifier {
    fn default() -> Self {
        Self::new(Classification::Fatal)
    }
}

impl BinaryFailureClassifier {
    pub fn new(default: Classification) -> Self {
        Self {
            kinds: HashMap::new(),
            default,
        }
    }

    /// Classifier that retries the given kinds and nothing else.
    pub fn retrying<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        kinds
            .into_iter()
            .fold(Self::default(), |classifier, kind| classifier.retry_on(kind))
    }

    pub fn retry_on(mut self, kind: impl Into<String>) -> Self {
        self.kinds.insert(kind.into(), Classification::Retryable);
        self
    }

    pub fn fatal_on(mut self, kind: impl Into<String>) -> Self {
        self.kinds.insert(kind.into(), Classification::Fatal);
        self
    }

    pub fn default_classification(&self) -> Classification {
        self.default
    }
}

impl FailureClassifier for BinaryFailureClassifier {
    fn classify(&self, error: &BatchError) -> Classification {
        if error.is_fatal() || error.is_interruption() {
            return Classification::Fatal;
        }
        self.kinds
            .get(error.kind())
            .copied()
            .unwrap_or(self.default)
    }
}
