//! Bounded pool of transports.
//!
//! Every transport is in `all` exactly once and in exactly one of `available`
//! or `locked`. Moving between those sets is the only mutation the pool
//! performs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::native::{NativeFactory, ReqwestFactory};
use crate::request::TransportOptions;
use crate::sync::guard;
use crate::transport::Transport;

/// Default maximum number of transports
pub const DEFAULT_MAX_SIZE: usize = 25;
/// Default delay between checks for a free transport
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(250);
/// Default number of checks before giving up
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 20;

/// Pool sizing and wait configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of transports
    pub max_size: usize,
    /// Delay between checks for a free transport when the pool is full
    pub poll_period: Duration,
    /// Number of checks before acquisition fails
    pub max_poll_attempts: u32,
}

impl PoolConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of transports
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the delay between checks
    pub fn poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    /// Set the number of checks before giving up
    pub fn max_poll_attempts(mut self, attempts: u32) -> Self {
        self.max_poll_attempts = attempts;
        self
    }

    /// Longest time an acquisition waits on a full pool
    pub fn max_wait(&self) -> Duration {
        self.poll_period * self.max_poll_attempts
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("Pool size must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            poll_period: DEFAULT_POLL_PERIOD,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        }
    }
}

/// Snapshot of pool membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub locked: usize,
}

#[derive(Default)]
struct PoolSets {
    all: Vec<Transport>,
    available: VecDeque<Transport>,
    locked: Vec<Transport>,
}

impl PoolSets {
    fn remove_locked(&mut self, transport: &Transport) -> bool {
        match self.locked.iter().position(|t| t == transport) {
            Some(index) => {
                self.locked.remove(index);
                true
            }
            None => false,
        }
    }

    fn remove_available(&mut self, transport: &Transport) -> bool {
        match self.available.iter().position(|t| t == transport) {
            Some(index) => {
                self.available.remove(index);
                true
            }
            None => false,
        }
    }
}

pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    pub(crate) factory: Arc<dyn NativeFactory>,
    pub(crate) defaults: Arc<TransportOptions>,
    next_id: AtomicU64,
    sets: Mutex<PoolSets>,
}

impl PoolShared {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Pool manager owning a bounded set of [`Transport`]s
///
/// Clones share the same pool. Transports only keep a weak reference back,
/// so dropping the last clone frees the pool and every idle transport.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Create a pool
    ///
    /// `defaults` are the options every transport of this pool starts from.
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn NativeFactory>,
        defaults: TransportOptions,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, factory, defaults))
    }

    fn from_parts(
        config: PoolConfig,
        factory: Arc<dyn NativeFactory>,
        defaults: TransportOptions,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                factory,
                defaults: Arc::new(defaults),
                next_id: AtomicU64::new(1),
                sets: Mutex::new(PoolSets::default()),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Options every new transport starts from
    pub fn defaults(&self) -> &TransportOptions {
        &self.shared.defaults
    }

    /// Get a locked transport, waiting for one to free up if the pool is full
    ///
    /// A free transport is reused before a new one is created. Once the pool
    /// is at its maximum size, it is checked again every
    /// [`PoolConfig::poll_period`], up to [`PoolConfig::max_poll_attempts`]
    /// times, before failing with [`Error::PoolExhausted`].
    pub async fn acquire(&self) -> Result<Transport> {
        if let Some(transport) = self.try_acquire() {
            return Ok(transport);
        }

        let config = &self.shared.config;
        debug!(max_size = config.max_size, "pool is full, waiting for a transport");

        for attempt in 1..=config.max_poll_attempts {
            tokio::time::sleep(config.poll_period).await;
            if let Some(transport) = self.try_acquire() {
                debug!(attempt, transport = transport.id(), "transport freed up");
                return Ok(transport);
            }
        }

        warn!(
            attempts = config.max_poll_attempts,
            max_size = config.max_size,
            "no transport became available"
        );
        Err(Error::pool_exhausted(config.max_poll_attempts, config.poll_period))
    }

    /// Get a locked transport without waiting
    ///
    /// Returns `None` when every transport is locked and the pool is full.
    pub fn try_acquire(&self) -> Option<Transport> {
        let mut sets = self.sets();

        if let Some(transport) = sets.available.pop_front() {
            debug!(transport = transport.id(), "reusing available transport");
            sets.locked.push(transport.clone());
            return Some(transport);
        }

        if sets.all.len() < self.shared.config.max_size {
            let transport = Transport::unregistered(self);
            debug!(
                transport = transport.id(),
                total = sets.all.len() + 1,
                "creating transport"
            );
            sets.all.push(transport.clone());
            sets.locked.push(transport.clone());
            return Some(transport);
        }

        None
    }

    /// Add a new transport as available
    pub fn register(&self, transport: &Transport) {
        let mut sets = self.sets();
        if sets.all.contains(transport) {
            return;
        }
        sets.all.push(transport.clone());
        sets.available.push_back(transport.clone());
    }

    /// Remove a transport from the pool entirely
    pub fn unregister(&self, transport: &Transport) {
        let mut sets = self.sets();
        sets.all.retain(|t| t != transport);
        sets.remove_available(transport);
        sets.remove_locked(transport);
    }

    /// Move an available transport to the locked set
    ///
    /// Does nothing if the transport is not currently available.
    pub fn lock(&self, transport: &Transport) {
        let mut sets = self.sets();
        if sets.remove_available(transport) {
            sets.locked.push(transport.clone());
        }
    }

    /// Move a locked transport back to the available set
    ///
    /// Does nothing if the transport is not currently locked.
    pub fn release(&self, transport: &Transport) {
        let mut sets = self.sets();
        if sets.remove_locked(transport) {
            sets.available.push_back(transport.clone());
        }
    }

    /// Current membership counts
    pub fn stats(&self) -> PoolStats {
        let sets = self.sets();
        PoolStats {
            total: sets.all.len(),
            available: sets.available.len(),
            locked: sets.locked.len(),
        }
    }

    /// Number of transports in the pool
    pub fn len(&self) -> usize {
        self.sets().all.len()
    }

    /// Check if the pool has no transports
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if a transport belongs to this pool
    pub fn contains(&self, transport: &Transport) -> bool {
        self.sets().all.contains(transport)
    }

    /// Check if a transport is locked
    pub fn is_locked(&self, transport: &Transport) -> bool {
        self.sets().locked.contains(transport)
    }

    /// Check if a transport is available
    pub fn is_available(&self, transport: &Transport) -> bool {
        self.sets().available.contains(transport)
    }

    fn sets(&self) -> MutexGuard<'_, PoolSets> {
        guard(&self.shared.sets)
    }
}

impl Default for Pool {
    /// Default-sized pool of reqwest-backed transports
    fn default() -> Self {
        Self::from_parts(
            PoolConfig::default(),
            Arc::new(ReqwestFactory::default()),
            TransportOptions::default(),
        )
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::testing::ScriptedFactory;
    use std::collections::HashSet;

    fn pool(config: PoolConfig) -> (Pool, Arc<ScriptedFactory>) {
        let factory = Arc::new(ScriptedFactory::default());
        let pool = Pool::new(config, factory.clone(), TransportOptions::default()).unwrap();
        (pool, factory)
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, 25);
        assert_eq!(config.poll_period, Duration::from_millis(250));
        assert_eq!(config.max_poll_attempts, 20);
        assert_eq!(config.max_wait(), Duration::from_secs(5));
    }

    #[test]
    fn test_pool_config_rejects_zero_size() {
        let factory = Arc::new(ScriptedFactory::default());
        let result = Pool::new(
            PoolConfig::new().max_size(0),
            factory,
            TransportOptions::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_acquire_creates_distinct_locked_transports() {
        let (pool, factory) = pool(PoolConfig::new().max_size(5));

        let mut ids = HashSet::new();
        let mut transports = Vec::new();
        for _ in 0..5 {
            let transport = pool.acquire().await.unwrap();
            ids.insert(transport.id());
            transports.push(transport);
        }

        assert_eq!(ids.len(), 5);
        assert_eq!(factory.created(), 5);
        assert_eq!(
            pool.stats(),
            PoolStats {
                total: 5,
                available: 0,
                locked: 5
            }
        );
        assert!(transports.iter().all(|t| pool.is_locked(t)));
    }

    #[tokio::test]
    async fn test_release_is_reused_before_growth() {
        let (pool, factory) = pool(PoolConfig::default());
        let first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();

        pool.release(&first);
        assert!(pool.is_available(&first));

        let again = pool.acquire().await.unwrap();
        assert_eq!(again, first);
        assert_eq!(factory.created(), 2);
        assert!(pool.is_locked(&first));
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts() {
        let config = PoolConfig::new()
            .max_size(2)
            .poll_period(Duration::from_millis(5))
            .max_poll_attempts(3);
        let (pool, factory) = pool(config);
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let started = std::time::Instant::now();
        let err = pool.acquire().await.unwrap_err();

        match err {
            Error::PoolExhausted { attempts, waited } => {
                assert_eq!(attempts, 3);
                assert_eq!(waited, Duration::from_millis(15));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(15));
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_transport() {
        let config = PoolConfig::new()
            .max_size(1)
            .poll_period(Duration::from_millis(5))
            .max_poll_attempts(50);
        let (pool, _factory) = pool(config);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(12)).await;
        pool.release(&held);

        let acquired = waiter.await.unwrap().unwrap();
        assert_eq!(acquired, held);
        assert!(pool.is_locked(&held));
    }

    #[test]
    fn test_lock_and_release_are_noops_outside_their_set() {
        let (pool, _factory) = pool(PoolConfig::default());
        let transport = Transport::new(&pool);
        assert!(pool.is_available(&transport));

        pool.release(&transport);
        assert!(pool.is_available(&transport));

        pool.lock(&transport);
        pool.lock(&transport);
        assert_eq!(pool.stats().locked, 1);
        assert_eq!(pool.stats().available, 0);
    }

    #[test]
    fn test_register_and_unregister() {
        let (pool, _factory) = pool(PoolConfig::default());
        let transport = Transport::new(&pool);
        pool.register(&transport);
        assert_eq!(pool.len(), 1);

        pool.lock(&transport);
        pool.unregister(&transport);
        assert!(!pool.contains(&transport));
        assert_eq!(pool.stats(), PoolStats::default());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_membership_is_disjoint() {
        let (pool, _factory) = pool(PoolConfig::new().max_size(3));
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        pool.release(&a);

        for transport in [&a, &b] {
            assert!(pool.contains(transport));
            assert_ne!(pool.is_available(transport), pool.is_locked(transport));
        }
        let stats = pool.stats();
        assert_eq!(stats.total, stats.available + stats.locked);
    }
}
