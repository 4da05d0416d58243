use crate::config::WriterConfig;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay schedule indexed by the number of attempts made so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately
    None,
    /// `step * n`
    Linear { step: Duration },
    /// `base * 2^n`
    Exponential { base: Duration },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { step } => step.saturating_mul(attempt),
            Backoff::Exponential { base } => {
                base.saturating_mul(2u32.saturating_pow(attempt))
            }
        }
    }
}

/// Attempt limit plus one backoff per failure cause.
///
/// A call that fails outright waits on `on_call_error`; a call that succeeds
/// but leaves items unprocessed waits on `on_partial`. Both share the same
/// attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub on_call_error: Backoff,
    pub on_partial: Backoff,
}

impl RetryPolicy {
    /// 5 attempts; `2^n` s after a failed call, `n * 500` ms after a partial write.
    pub fn standard() -> Self {
        Self {
            max_attempts: 5,
            on_call_error: Backoff::Exponential {
                base: Duration::from_secs(1),
            },
            on_partial: Backoff::Linear {
                step: Duration::from_millis(500),
            },
        }
    }

    /// 3 attempts, `n` s for either cause. Used as a last resort.
    pub fn fallback() -> Self {
        let linear = Backoff::Linear {
            step: Duration::from_secs(1),
        };
        Self {
            max_attempts: 3,
            on_call_error: linear,
            on_partial: linear,
        }
    }

    pub fn from_config(config: &WriterConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            on_call_error: Backoff::Exponential {
                base: Duration::from_millis(config.call_error_backoff_base_ms),
            },
            on_partial: Backoff::Linear {
                step: Duration::from_millis(config.partial_backoff_step_ms),
            },
        }
    }

    pub fn fallback_from_config(config: &WriterConfig) -> Self {
        let linear = Backoff::Linear {
            step: Duration::from_millis(config.fallback_backoff_step_ms),
        };
        Self {
            max_attempts: config.fallback_max_attempts,
            on_call_error: linear,
            on_partial: linear,
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Sleep for `delay` unless `cancel` fires first. Returns `false` if cancelled.
pub(crate) async fn wait(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }

    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}
