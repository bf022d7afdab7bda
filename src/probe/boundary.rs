//! Largest accepted value of a monotone predicate
//!
//! The search doubles from 1 until the predicate rejects or the ceiling is
//! reached, then bisects between the last success and the first failure.
//! An error from the predicate stops the search at once; the result is then
//! only a lower bound.

use std::future::Future;

use tracing::trace;

/// Predicate error that stopped a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aborted<E> {
    /// Value being evaluated when the error occurred
    pub attempted: usize,
    pub error: E,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome<E> {
    /// Largest value confirmed accepted, 0 if none
    pub bound: usize,
    pub ceiling: usize,
    /// `accepts(ceiling)` held; the true limit may be higher
    pub exhausted_ceiling: bool,
    pub evaluations: usize,
    pub aborted: Option<Aborted<E>>,
}

struct Search {
    ceiling: usize,
    evaluations: usize,
    last_success: usize,
}

impl Search {
    fn finish<E>(self, aborted: Option<Aborted<E>>) -> SearchOutcome<E> {
        SearchOutcome {
            bound: self.last_success,
            ceiling: self.ceiling,
            exhausted_ceiling: self.ceiling > 0 && self.last_success == self.ceiling,
            evaluations: self.evaluations,
            aborted,
        }
    }
}

/// Find the largest `k <= ceiling` with `accepts(k)`.
///
/// `Ok(false)` means rejected; `Err` aborts the search. Every value is
/// evaluated at most once and the predicate is never called with 0.
pub async fn search<F, Fut, E>(ceiling: usize, mut accepts: F) -> SearchOutcome<E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let mut state = Search {
        ceiling,
        evaluations: 0,
        last_success: 0,
    };
    if ceiling == 0 {
        return state.finish(None);
    }

    // Exponential phase
    let mut candidate = 1;
    let first_failure = loop {
        state.evaluations += 1;
        match accepts(candidate).await {
            Ok(true) => {
                trace!(candidate, "accepted");
                state.last_success = candidate;
                if candidate == ceiling {
                    return state.finish(None);
                }
                candidate = candidate.saturating_mul(2).min(ceiling);
            }
            Ok(false) => {
                trace!(candidate, "rejected");
                break candidate;
            }
            Err(error) => {
                let aborted = Aborted {
                    attempted: candidate,
                    error,
                };
                return state.finish(Some(aborted));
            }
        }
    };

    // Binary phase: last_success accepted, high rejected
    let mut high = first_failure;
    while high - state.last_success > 1 {
        let mid = state.last_success + (high - state.last_success) / 2;
        state.evaluations += 1;
        match accepts(mid).await {
            Ok(true) => state.last_success = mid,
            Ok(false) => high = mid,
            Err(error) => {
                let aborted = Aborted {
                    attempted: mid,
                    error,
                };
                return state.finish(Some(aborted));
            }
        }
    }

    state.finish(None)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;

    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    async fn threshold(ceiling: usize, limit: usize) -> SearchOutcome<()> {
        search(ceiling, |n| async move { Ok::<_, ()>(n <= limit) }).await
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test_case(100, 0 ; "nothing accepted")]
    #[test_case(100, 1 ; "only one")]
    #[test_case(100, 37 ; "inside")]
    #[test_case(100, 64 ; "power of two")]
    #[test_case(100, 99 ; "just below ceiling")]
    #[test_case(65535, 32767 ; "large")]
    #[tokio::test]
    async fn test_finds_threshold(ceiling: usize, limit: usize) {
        let outcome = threshold(ceiling, limit).await;
        assert_eq!(outcome.bound, limit);
        assert!(!outcome.exhausted_ceiling);
        assert!(outcome.aborted.is_none());
    }

    #[tokio::test]
    async fn test_ceiling_accepted() {
        let outcome = threshold(100, 1000).await;
        assert_eq!(outcome.bound, 100);
        assert!(outcome.exhausted_ceiling);
        // 1, 2, 4, 8, 16, 32, 64, 100
        assert_eq!(outcome.evaluations, 8);
    }

    #[tokio::test]
    async fn test_zero_ceiling() {
        let outcome = search(0, |_| async { Err::<bool, _>("never called") }).await;
        assert_eq!(outcome.bound, 0);
        assert_eq!(outcome.evaluations, 0);
        assert!(!outcome.exhausted_ceiling);
    }

    #[tokio::test]
    async fn test_first_rejected() {
        let outcome = threshold(1000, 0).await;
        assert_eq!(outcome.bound, 0);
        assert_eq!(outcome.evaluations, 1);
    }

    #[tokio::test]
    async fn test_error_pins_last_success() {
        let outcome = search(1000, |n| async move {
            match n {
                n if n <= 8 => Ok(true),
                _ => Err(format!("reset at {}", n)),
            }
        })
        .await;
        assert_eq!(outcome.bound, 8);
        assert!(!outcome.exhausted_ceiling);
        assert_eq!(
            outcome.aborted,
            Some(Aborted {
                attempted: 16,
                error: "reset at 16".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_error_during_bisection() {
        let outcome = search(1000, |n| async move {
            match n {
                n if n <= 20 => Ok(true),
                32 => Ok(false),
                _ => Err(()),
            }
        })
        .await;
        // 1..16 accepted, 32 rejected, 24 errors
        assert_eq!(outcome.bound, 16);
        assert_eq!(outcome.aborted.map(|a| a.attempted), Some(24));
    }

    proptest! {
        #[test]
        fn prop_monotone_threshold(ceiling in 1usize..200_000, frac in 0.0f64..1.2) {
            let limit = (ceiling as f64 * frac) as usize;
            let seen = RefCell::new(HashSet::new());
            let outcome = block_on(search(ceiling, |n| {
                let fresh = seen.borrow_mut().insert(n);
                async move {
                    assert!(fresh, "{} evaluated twice", n);
                    assert!(n >= 1);
                    Ok::<_, ()>(n <= limit)
                }
            }));

            prop_assert_eq!(outcome.bound, limit.min(ceiling));
            prop_assert!(outcome.bound <= outcome.ceiling);
            prop_assert_eq!(outcome.exhausted_ceiling, limit >= ceiling);
            let log = usize::BITS - ceiling.leading_zeros();
            prop_assert!(outcome.evaluations <= 2 * log as usize + 2);
        }
    }
}
