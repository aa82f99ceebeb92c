//! Ordered fallbacks
//!
//! "Try each candidate until one succeeds", used for logo paths, playback
//! retries and capture format negotiation.

use std::fmt;
use std::future::Future;

/// Every candidate failed (or there were none)
#[derive(Debug)]
pub struct FallbackError<E> {
    /// Errors in candidate order
    pub errors: Vec<E>,
}

impl<E> FallbackError<E> {
    /// True when no candidate was attempted at all
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// The error of the final attempt
    pub fn last(&self) -> Option<&E> {
        self.errors.last()
    }

    pub fn into_last(self) -> Option<E> {
        self.errors.into_iter().last()
    }
}

impl<E: fmt::Display> fmt::Display for FallbackError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.last() {
            Some(last) => write!(f, "{} attempt(s) failed, last: {}", self.errors.len(), last),
            None => write!(f, "no candidates to try"),
        }
    }
}

/// Await `attempt` on each candidate in order, returning the first success.
pub async fn try_each<C, T, E, F, Fut>(
    candidates: impl IntoIterator<Item = C>,
    mut attempt: F,
) -> Result<T, FallbackError<E>>
where
    F: FnMut(C) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut errors = Vec::new();
    for candidate in candidates {
        match attempt(candidate).await {
            Ok(value) => return Ok(value),
            Err(e) => errors.push(e),
        }
    }
    Err(FallbackError { errors })
}

/// Synchronous variant of [`try_each`].
pub fn try_each_sync<C, T, E, F>(
    candidates: impl IntoIterator<Item = C>,
    mut attempt: F,
) -> Result<T, FallbackError<E>>
where
    F: FnMut(C) -> Result<T, E>,
{
    let mut errors = Vec::new();
    for candidate in candidates {
        match attempt(candidate) {
            Ok(value) => return Ok(value),
            Err(e) => errors.push(e),
        }
    }
    Err(FallbackError { errors })
}
