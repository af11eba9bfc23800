//! Explicitly constructed configuration for the learner and proposer roles.
//!
//! Nothing here is read from ambient process state; the embedding process
//! parses whatever it parses and hands the finished values in.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Port the data plane steers decision traffic to.
pub const DEFAULT_LEARNER_PORT: u16 = 34952;

/// Configuration for exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff duration.
    pub initial: Duration,
    /// Maximum backoff duration.
    pub max: Duration,
    /// Multiplier for each retry (typically 2.0).
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff duration for a given retry count with jitter.
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(retries.cast_signed());
        let capped = base.min(self.max.as_secs_f64());
        // jitter: 50% to 150% of the base duration
        let jitter_factor = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter_factor)
    }
}

/// Sleep function trait so tests can control time.
pub trait Sleep: Send + 'static {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Tokio-based sleep implementation.
#[derive(Clone, Copy, Default)]
pub struct TokioSleep;

impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Bounded retry for gap recovery.
///
/// The first recovery prepare for a missing instance goes out immediately;
/// `max_attempts` bounds the re-sends after it. Exhausting the budget is an
/// operational failure, not another retry.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Configuration for the learner role.
pub struct LearnerConfig<S: Sleep = TokioSleep, R: Rng = StdRng> {
    /// Where synthesized paxos traffic (recovery prepares, promoted
    /// accepts) is sent: the data-plane coordinator.
    pub dest: SocketAddr,
    /// Size of the acceptor set, from which the quorum is derived.
    pub num_acceptors: usize,
    /// Gap-recovery retry policy.
    pub retry: RetryConfig,
    /// Sleep implementation for retry pacing.
    pub sleep: S,
    /// RNG for backoff jitter.
    pub rng: R,
}

impl LearnerConfig {
    #[must_use]
    pub fn new(dest: SocketAddr, num_acceptors: usize) -> Self {
        Self {
            dest,
            num_acceptors,
            retry: RetryConfig::default(),
            sleep: TokioSleep,
            rng: StdRng::from_os_rng(),
        }
    }
}

impl<S: Sleep> LearnerConfig<S, StdRng> {
    /// Construct with a custom sleep and a seeded RNG for deterministic
    /// tests.
    #[must_use]
    pub fn with_seed(
        dest: SocketAddr,
        num_acceptors: usize,
        retry: RetryConfig,
        sleep: S,
        seed: u64,
    ) -> Self {
        Self {
            dest,
            num_acceptors,
            retry,
            sleep,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

/// Configuration for the proposer role.
#[derive(Debug, Clone)]
pub struct ProposerConfig {
    /// Where submissions are sent.
    pub dest: SocketAddr,
    /// Round stamped on submissions. This proposer rides on the data
    /// plane's phase-1 guarantees instead of negotiating rounds itself.
    pub round: u8,
}

impl ProposerConfig {
    #[must_use]
    pub fn new(dest: SocketAddr, round: u8) -> Self {
        Self { dest, round }
    }
}
