// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded polling with a fixed interval.
//!
//! [`RetryPolicy::poll_with`] is generic over the sleep function, so it runs
//! on any executor; [`RetryPolicy::poll`] plugs in `tokio::time::sleep`.

use std::future::Future;
use std::time::Duration;

/// How many times to poll and how long to wait between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of polls. Zero means never poll.
    pub max_attempts: u32,
    /// Fixed wait between two polls.
    pub interval: Duration,
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The awaited condition holds.
    Ready(T),
    /// Not there yet, poll again.
    Pending,
}

/// Final result of a polling run.
#[derive(Debug)]
pub enum PollOutcome<T, E> {
    /// The condition was observed.
    Ready {
        /// Value produced by the successful poll.
        value: T,
        /// Polls performed, including the successful one.
        attempts: u32,
    },
    /// The attempt budget ran out.
    Exhausted {
        /// Polls performed.
        attempts: u32,
        /// Most recent poll error, if any poll failed.
        last_error: Option<E>,
    },
}

impl<T, E> PollOutcome<T, E> {
    /// Number of polls performed.
    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts, .. } | PollOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Poll `op` until it reports ready or the budget is spent.
    ///
    /// Errors from `op` count as a spent attempt and are otherwise ignored;
    /// the last one is returned on exhaustion. `sleep` runs between polls,
    /// never after the final one.
    pub async fn poll_with<T, E, Op, OpFut, S, SFut>(
        &self,
        mut op: Op,
        mut sleep: S,
    ) -> PollOutcome<T, E>
    where
        Op: FnMut(u32) -> OpFut,
        OpFut: Future<Output = Result<Attempt<T>, E>>,
        S: FnMut(Duration) -> SFut,
        SFut: Future<Output = ()>,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match op(attempt).await {
                Ok(Attempt::Ready(value)) => {
                    return PollOutcome::Ready {
                        value,
                        attempts: attempt,
                    };
                }
                Ok(Attempt::Pending) => {}
                Err(e) => last_error = Some(e),
            }

            if attempt < self.max_attempts {
                sleep(self.interval).await;
            }
        }

        PollOutcome::Exhausted {
            attempts: self.max_attempts,
            last_error,
        }
    }

    /// [`poll_with`](Self::poll_with) using the tokio timer.
    pub async fn poll<T, E, Op, OpFut>(&self, op: Op) -> PollOutcome<T, E>
    where
        Op: FnMut(u32) -> OpFut,
        OpFut: Future<Output = Result<Attempt<T>, E>>,
    {
        self.poll_with(op, tokio::time::sleep).await
    }
}
