//! Bounded-concurrency task execution.
//!
//! Sync flows hand a batch of per-item tasks to [`settle`], which runs at
//! most `limit` of them in flight and reports every outcome in-band: the
//! aggregate never fails, callers count successes and failures themselves.

use color_eyre::{Report, Result};
use futures::{Future, StreamExt, stream};

/// The result of one settled task.
#[derive(Debug)]
pub enum Outcome<T> {
    Fulfilled(T),
    Rejected(Report),
}

impl<T> Outcome<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Outcome::Fulfilled(_))
    }

    pub fn fulfilled(self) -> Option<T> {
        match self {
            Outcome::Fulfilled(value) => Some(value),
            Outcome::Rejected(_) => None,
        }
    }

    pub fn rejected(self) -> Option<Report> {
        match self {
            Outcome::Fulfilled(_) => None,
            Outcome::Rejected(err) => Some(err),
        }
    }
}

/// Run every task with at most `limit` in flight, returning outcomes in task
/// order once all have settled.
pub async fn settle<T, F>(limit: usize, tasks: Vec<F>) -> Vec<Outcome<T>>
where
    F: Future<Output = Result<T>>,
{
    let mut settled = stream::iter(
        tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| async move { (index, task.await) }),
    )
    .buffer_unordered(limit.max(1))
    .collect::<Vec<_>>()
    .await;

    settled.sort_by_key(|(index, _)| *index);
    settled
        .into_iter()
        .map(|(_, result)| match result {
            Ok(value) => Outcome::Fulfilled(value),
            Err(err) => Outcome::Rejected(err),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use std::time::Duration;

    use color_eyre::eyre::eyre;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn reports_every_outcome_in_order() {
        let tasks = (0..5)
            .map(|n| async move {
                if n == 2 {
                    Err(eyre!("task {n} failed"))
                } else {
                    Ok(n)
                }
            })
            .collect::<Vec<_>>();

        let outcomes = settle(2, tasks).await;
        assert_eq!(outcomes.len(), 5);
        assert!(outcomes[2].is_rejected_with("task 2 failed"));
        let fulfilled = outcomes
            .into_iter()
            .filter_map(Outcome::fulfilled)
            .collect::<Vec<_>>();
        assert_eq!(fulfilled, vec![0, 1, 3, 4]);
    }

    #[test_log::test(tokio::test)]
    async fn never_exceeds_the_concurrency_cap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..10)
            .map(|_| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .collect::<Vec<_>>();

        let outcomes = settle(3, tasks).await;
        assert_eq!(outcomes.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    impl<T> Outcome<T> {
        fn is_rejected_with(&self, message: &str) -> bool {
            match self {
                Outcome::Rejected(err) => err.to_string().contains(message),
                Outcome::Fulfilled(_) => false,
            }
        }
    }
}
