// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policies
//!
//! This module defines the backoff schedule shared by the two independent retry
//! loops of the adapter: broker reconnection and HTTP sends. Waiting is done
//! through the `Sleeper` abstraction so the schedule can be driven without
//! real delays.

use crate::errors::AdapterError;
use async_trait::async_trait;
use std::{fmt, str::FromStr, time::Duration};

/// Default delay between HTTP send attempts.
pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_millis(50);

const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Schedule used to compute the wait between two attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Same delay before every retry.
    Linear,
    /// Delay doubles on every retry, starting from the initial delay.
    #[default]
    Exponential,
}

impl FromStr for BackoffPolicy {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(BackoffPolicy::Linear),
            "exponential" => Ok(BackoffPolicy::Exponential),
            other => Err(AdapterError::ConfigurationError(format!(
                "invalid backoff policy `{}`: must be \"exponential\" or \"linear\"",
                other
            ))),
        }
    }
}

impl fmt::Display for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffPolicy::Linear => write!(f, "linear"),
            BackoffPolicy::Exponential => write!(f, "exponential"),
        }
    }
}

/// Attempt budget and backoff schedule for one retry loop.
///
/// `max_attempts` counts every try, the first one included. Zero behaves like
/// one: a single attempt with no retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::no_retry()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy, initial_delay: Duration) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff,
            initial_delay,
        }
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            backoff: BackoffPolicy::default(),
            initial_delay: DEFAULT_BACKOFF_DELAY,
        }
    }

    /// Total number of tries allowed by this policy.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait before the given retry (1-based: the first retry is 1).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            BackoffPolicy::Linear => self.initial_delay,
            BackoffPolicy::Exponential => {
                let exponent = retry.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
                self.initial_delay
                    .saturating_mul(2_u32.saturating_pow(exponent))
            }
        }
    }
}

/// Clock abstraction for backoff waits.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}
