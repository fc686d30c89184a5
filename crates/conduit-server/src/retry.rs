use std::future::Future;
use std::time::Duration;

use conduit_common::config;
use log::warn;

#[derive(Debug, Clone)]
pub enum RetryStrategy {
    Fixed {
        max_count: usize,
        delay: Duration,
    },
    ExponentialBackoff {
        max_count: usize,
        initial_delay: Duration,
        max_delay: Duration,
        factor: u32,
    },
}

struct ExponentialBackoffDelay {
    delay: Duration,
    max_delay: Duration,
    factor: u32,
}

impl Iterator for ExponentialBackoffDelay {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let delay = self.delay;
        self.delay = std::cmp::min(delay * self.factor, self.max_delay);
        Some(delay)
    }
}

impl RetryStrategy {
    pub fn iter(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self {
            Self::ExponentialBackoff {
                max_count,
                initial_delay,
                max_delay,
                factor,
            } => Box::new(
                ExponentialBackoffDelay {
                    delay: *initial_delay,
                    max_delay: *max_delay,
                    factor: *factor,
                }
                .take(*max_count),
            ),
            Self::Fixed { max_count, delay } => {
                Box::new(std::iter::repeat(*delay).take(*max_count))
            }
        }
    }

    /// The delay for the given zero-based attempt number, capped at the
    /// schedule's final delay. Used when retries are scheduled one event
    /// at a time rather than driven by [`Retryable::retry`].
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            Self::Fixed { delay, .. } => *delay,
            Self::ExponentialBackoff {
                initial_delay,
                max_delay,
                factor,
                ..
            } => {
                let mut delay = *initial_delay;
                for _ in 0..attempt {
                    delay = std::cmp::min(delay * *factor, *max_delay);
                    if delay == *max_delay {
                        break;
                    }
                }
                delay
            }
        }
    }

    pub fn max_count(&self) -> usize {
        match self {
            Self::Fixed { max_count, .. } => *max_count,
            Self::ExponentialBackoff { max_count, .. } => *max_count,
        }
    }
}

impl From<&config::RetryStrategy> for RetryStrategy {
    fn from(config: &config::RetryStrategy) -> Self {
        match config {
            config::RetryStrategy::Fixed {
                max_count,
                delay_secs,
            } => Self::Fixed {
                max_count: *max_count,
                delay: Duration::from_secs(*delay_secs),
            },
            config::RetryStrategy::ExponentialBackoff {
                max_count,
                initial_delay_secs,
                max_delay_secs,
                factor,
            } => Self::ExponentialBackoff {
                max_count: *max_count,
                initial_delay: Duration::from_secs(*initial_delay_secs),
                max_delay: Duration::from_secs(*max_delay_secs),
                factor: *factor,
            },
        }
    }
}

#[async_trait::async_trait]
pub trait Retryable<F, Fut, T, E> {
    async fn retry(self, strategy: RetryStrategy) -> Result<T, E>;
}

#[async_trait::async_trait]
impl<F, Fut, T, E> Retryable<F, Fut, T, E> for F
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send,
    E: std::fmt::Display + Send,
{
    async fn retry(mut self, strategy: RetryStrategy) -> Result<T, E> {
        let mut delay = strategy.iter();
        loop {
            match self().await {
                x @ Ok(_) => return x,
                Err(e) => {
                    warn!("retryable operation failed: {e}");
                    if let Some(delay) = delay.next() {
                        tokio::time::sleep(delay).await;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_exponential_backoff_delays_are_capped() {
        let strategy = RetryStrategy::ExponentialBackoff {
            max_count: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            factor: 2,
        };
        let delays: Vec<_> = strategy.iter().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
        assert_eq!(strategy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(strategy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(strategy.delay_for_attempt(100), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let result: Result<usize, String> = (move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .retry(RetryStrategy::Fixed {
            max_count: 5,
            delay: Duration::from_millis(1),
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_last_error() {
        let result: Result<(), String> = (|| async { Err("always".to_string()) })
            .retry(RetryStrategy::Fixed {
                max_count: 2,
                delay: Duration::from_millis(1),
            })
            .await;
        assert_eq!(result, Err("always".to_string()));
    }
}
