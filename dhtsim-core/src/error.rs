//! Error taxonomy of the simulation substrate.

use thiserror::Error;

/// A one-shot request was resolved more than once, or a handler broke the
/// single-slot queue contract. Always a programming error, never expected
/// during correct operation; callers treat it as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request resolved more than once")]
pub struct ProtocolViolation;

/// A timed wait expired before every awaited request resolved.
///
/// Carries the subset of values that did arrive, so callers can distinguish
/// "some responded" from "none responded".
#[derive(Debug, Error)]
#[error("wait expired with {}/{expected} responses", received.len())]
pub struct PartialTimeout<T: std::fmt::Debug> {
    /// Values received before the timeout fired.
    pub received: Vec<T>,
    /// Number of requests the wait covered.
    pub expected: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_timeout_display() {
        let err = PartialTimeout {
            received: vec![1u32, 2],
            expected: 5,
        };
        assert_eq!(err.to_string(), "wait expired with 2/5 responses");
    }
}
