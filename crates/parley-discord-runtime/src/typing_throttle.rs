//! Per-channel typing-indicator throttle.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Discord channel snowflake.
pub type ChannelId = u64;

/// Minimum spacing between two typing emissions on one channel.
pub const DEFAULT_TYPING_COOLDOWN: Duration = Duration::from_secs(5);
/// Pause applied after a rate-limited emission that carried no retry hint.
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(5);
/// Longest pause a rate-limited emission may impose while holding the gate.
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TypingSignalError {
    #[error("typing indicator rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("typing indicator failed: {0}")]
    Failed(String),
}

#[async_trait]
/// Messaging-platform call that shows the "typing" presence in a channel.
pub trait TypingSignal: Send + Sync {
    async fn send_typing(&self, channel_id: ChannelId) -> Result<(), TypingSignalError>;
}

type ChannelGate = Arc<tokio::sync::Mutex<Option<Instant>>>;

/// Serializes typing emissions per channel and spaces them by a cooldown.
///
/// Every call emits exactly once; callers on a busy channel wait in line for
/// the gate and then for the remainder of the cooldown. The gate map only
/// grows, one entry per channel seen.
pub struct TypingThrottle<S> {
    signal: S,
    cooldown: Duration,
    rate_limit_backoff: Duration,
    gates: Mutex<HashMap<ChannelId, ChannelGate>>,
}

impl<S: TypingSignal> TypingThrottle<S> {
    pub fn new(signal: S, cooldown: Duration) -> Self {
        Self {
            signal,
            cooldown,
            rate_limit_backoff: DEFAULT_RATE_LIMIT_BACKOFF,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_rate_limit_backoff(mut self, backoff: Duration) -> Self {
        self.rate_limit_backoff = backoff;
        self
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn gate(&self, channel_id: ChannelId) -> ChannelGate {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel_id)
            .or_default()
            .clone()
    }

    /// Emits one typing indicator for `channel_id`, waiting out the cooldown
    /// first. Failures are logged, never returned.
    pub async fn signal(&self, channel_id: ChannelId) {
        let gate = self.gate(channel_id);
        let mut last_emitted = gate.lock().await;

        if let Some(last) = *last_emitted {
            let elapsed = last.elapsed();
            if elapsed < self.cooldown {
                sleep(self.cooldown - elapsed).await;
            }
        }

        let result = self.signal.send_typing(channel_id).await;
        *last_emitted = Some(Instant::now());

        match result {
            Ok(()) => tracing::debug!(channel_id, "typing indicator sent"),
            Err(TypingSignalError::RateLimited { retry_after }) => {
                let delay = retry_after
                    .unwrap_or(self.rate_limit_backoff)
                    .min(MAX_RATE_LIMIT_WAIT);
                tracing::warn!(
                    channel_id,
                    retry_after_ms = delay.as_millis() as u64,
                    "typing indicator rate limited"
                );
                sleep(delay).await;
            }
            Err(error) => tracing::warn!(channel_id, %error, "typing indicator failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::{ChannelId, TypingSignal, TypingSignalError, TypingThrottle, MAX_RATE_LIMIT_WAIT};

    #[derive(Clone, Copy)]
    enum Outcome {
        Ok,
        RateLimited(Option<Duration>),
        Failed,
    }

    #[derive(Clone)]
    struct RecordingSignal {
        emissions: Arc<Mutex<Vec<(ChannelId, Instant)>>>,
        outcome: Outcome,
    }

    impl RecordingSignal {
        fn new(outcome: Outcome) -> Self {
            Self {
                emissions: Arc::new(Mutex::new(Vec::new())),
                outcome,
            }
        }

        fn emissions_for(&self, channel_id: ChannelId) -> Vec<Instant> {
            self.emissions
                .lock()
                .expect("emissions")
                .iter()
                .filter(|(channel, _)| *channel == channel_id)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    #[async_trait]
    impl TypingSignal for RecordingSignal {
        async fn send_typing(&self, channel_id: ChannelId) -> Result<(), TypingSignalError> {
            self.emissions
                .lock()
                .expect("emissions")
                .push((channel_id, Instant::now()));
            match self.outcome {
                Outcome::Ok => Ok(()),
                Outcome::RateLimited(retry_after) => {
                    Err(TypingSignalError::RateLimited { retry_after })
                }
                Outcome::Failed => Err(TypingSignalError::Failed("boom".to_string())),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn functional_concurrent_signals_on_one_channel_are_spaced_by_cooldown() {
        let signal = RecordingSignal::new(Outcome::Ok);
        let throttle = Arc::new(TypingThrottle::new(signal.clone(), Duration::from_secs(5)));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let throttle = throttle.clone();
            handles.push(tokio::spawn(async move { throttle.signal(10).await }));
        }
        for handle in handles {
            handle.await.expect("signal task");
        }

        let emissions = signal.emissions_for(10);
        assert_eq!(emissions.len(), 3);
        for pair in emissions.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn functional_distinct_channels_do_not_wait_on_each_other() {
        let signal = RecordingSignal::new(Outcome::Ok);
        let throttle = TypingThrottle::new(signal.clone(), Duration::from_secs(5));
        let started = Instant::now();

        throttle.signal(1).await;
        throttle.signal(2).await;

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(signal.emissions_for(1).len(), 1);
        assert_eq!(signal.emissions_for(2).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn regression_signal_after_cooldown_elapsed_does_not_sleep() {
        let signal = RecordingSignal::new(Outcome::Ok);
        let throttle = TypingThrottle::new(signal.clone(), Duration::from_secs(5));
        throttle.signal(4).await;
        tokio::time::advance(Duration::from_secs(7)).await;

        let before = Instant::now();
        throttle.signal(4).await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_rate_limited_signal_waits_retry_after_without_reemitting() {
        let signal = RecordingSignal::new(Outcome::RateLimited(Some(Duration::from_secs(2))));
        let throttle = TypingThrottle::new(signal.clone(), Duration::from_secs(5));
        let started = Instant::now();

        throttle.signal(3).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
        assert_eq!(signal.emissions_for(3).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn regression_rate_limit_without_hint_uses_default_backoff() {
        let signal = RecordingSignal::new(Outcome::RateLimited(None));
        let throttle = TypingThrottle::new(signal.clone(), Duration::from_secs(5))
            .with_rate_limit_backoff(Duration::from_secs(5));
        let started = Instant::now();

        throttle.signal(3).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn regression_failed_signal_is_swallowed_and_still_starts_cooldown() {
        let signal = RecordingSignal::new(Outcome::Failed);
        let throttle = TypingThrottle::new(signal.clone(), Duration::from_secs(5));
        let started = Instant::now();

        throttle.signal(8).await;
        throttle.signal(8).await;

        assert_eq!(signal.emissions_for(8).len(), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn regression_rate_limit_wait_is_capped_for_huge_retry_hints() {
        let year = Duration::from_secs(365 * 24 * 60 * 60);
        let signal = RecordingSignal::new(Outcome::RateLimited(Some(year)));
        let throttle = TypingThrottle::new(signal.clone(), Duration::from_secs(5));
        let started = Instant::now();

        throttle.signal(9).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= MAX_RATE_LIMIT_WAIT, "elapsed {elapsed:?}");
        assert!(elapsed < MAX_RATE_LIMIT_WAIT + Duration::from_secs(1), "elapsed {elapsed:?}");
    }
}
