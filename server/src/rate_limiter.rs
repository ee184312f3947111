//! Token buckets, keyed limiters and the named limiter store.
//!
//! A [`KeyedRateLimiter`] owns one [`TokenBucket`] per mangled key, created
//! lazily on first use and never removed. The [`RateLimiterStore`] binds each
//! named limiter to the console variables `rateLimiter_<name>_rate` and
//! `rateLimiter_<name>_burst` and re-applies them on every fetch, so limits
//! can be tuned while the server runs.
//!
//! Exhausting a bucket is expected traffic: `consume` reports it with `false`
//! and never errors.

use crate::console::Console;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

/// Replenishing balance of `burst` units refilled at `rate` units per second.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    balance: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self::new_at(rate, burst, Instant::now())
    }

    fn new_at(rate: f64, burst: f64, now: Instant) -> Self {
        Self {
            rate,
            burst,
            balance: burst,
            last_refill: now,
        }
    }

    pub fn consume(&mut self, amount: f64) -> bool {
        self.consume_at(amount, Instant::now())
    }

    /// Removes `amount` units if available. A failed attempt takes nothing.
    pub fn consume_at(&mut self, amount: f64, now: Instant) -> bool {
        self.refill(now);

        if self.balance >= amount {
            self.balance -= amount;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    fn reset_at(&mut self, now: Instant) {
        self.balance = self.burst;
        self.last_refill = now;
    }

    /// Changes rate and burst; the current balance is left as is.
    pub fn set_limits(&mut self, rate: f64, burst: f64) {
        self.rate = rate;
        self.burst = burst;
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.balance = (self.balance + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

/// Maps a key to the value its bucket is stored under.
pub trait RateLimitKey {
    type Mangled: Eq + Hash + Clone + Send;

    fn mangle(&self) -> Self::Mangled;
}

impl RateLimitKey for u32 {
    type Mangled = u32;

    fn mangle(&self) -> u32 {
        *self
    }
}

impl RateLimitKey for u16 {
    type Mangled = u16;

    fn mangle(&self) -> u16 {
        *self
    }
}

/// Addresses share a bucket per network: the port is discarded, IPv4-mapped
/// IPv6 addresses fold into IPv4, and IPv6 is cut to its /64 prefix, so
/// opening more sockets from one host does not buy more budget.
impl RateLimitKey for IpAddr {
    type Mangled = IpAddr;

    fn mangle(&self) -> IpAddr {
        match self {
            IpAddr::V4(v4) => IpAddr::V4(*v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => {
                    let segments = v6.segments();
                    IpAddr::V6(Ipv6Addr::new(
                        segments[0],
                        segments[1],
                        segments[2],
                        segments[3],
                        0,
                        0,
                        0,
                        0,
                    ))
                }
            },
        }
    }
}

impl RateLimitKey for SocketAddr {
    type Mangled = IpAddr;

    fn mangle(&self) -> IpAddr {
        self.ip().mangle()
    }
}

struct LimiterState<M> {
    rate: f64,
    burst: f64,
    buckets: HashMap<M, TokenBucket>,
}

/// A set of token buckets sharing one rate and burst, one bucket per key.
pub struct KeyedRateLimiter<K: RateLimitKey> {
    state: Mutex<LimiterState<K::Mangled>>,
}

impl<K: RateLimitKey> KeyedRateLimiter<K> {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                rate,
                burst,
                buckets: HashMap::new(),
            }),
        }
    }

    pub fn consume(&self, key: &K) -> bool {
        self.consume_n(key, 1.0)
    }

    pub fn consume_n(&self, key: &K, amount: f64) -> bool {
        self.consume_n_at(key, amount, Instant::now())
    }

    pub fn consume_n_at(&self, key: &K, amount: f64, now: Instant) -> bool {
        let mut state = self.state.lock();
        let (rate, burst) = (state.rate, state.burst);

        state
            .buckets
            .entry(key.mangle())
            .or_insert_with(|| TokenBucket::new_at(rate, burst, now))
            .consume_at(amount, now)
    }

    /// Restores the key's bucket to a full burst, creating it if needed.
    pub fn reset(&self, key: &K) {
        let mut state = self.state.lock();
        let (rate, burst) = (state.rate, state.burst);
        let now = Instant::now();

        state
            .buckets
            .entry(key.mangle())
            .or_insert_with(|| TokenBucket::new_at(rate, burst, now))
            .reset_at(now);
    }

    /// Applies new limits to every bucket if they differ from the current ones.
    pub fn update(&self, rate: f64, burst: f64) {
        let mut state = self.state.lock();

        if state.rate == rate && state.burst == burst {
            return;
        }

        debug!(
            "Rate limiter updated: rate {} -> {}, burst {} -> {}",
            state.rate, rate, state.burst, burst
        );

        state.rate = rate;
        state.burst = burst;
        for bucket in state.buckets.values_mut() {
            bucket.set_limits(rate, burst);
        }
    }

    pub fn limits(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.rate, state.burst)
    }

    pub fn tracked_keys(&self) -> usize {
        self.state.lock().buckets.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterDefaults {
    pub rate: f64,
    pub burst: f64,
}

impl RateLimiterDefaults {
    pub const fn new(rate: f64, burst: f64) -> Self {
        Self { rate, burst }
    }
}

pub fn rate_variable(name: &str) -> String {
    format!("rateLimiter_{}_rate", name)
}

pub fn burst_variable(name: &str) -> String {
    format!("rateLimiter_{}_burst", name)
}

/// Named limiters bound to live-tunable console variables.
pub struct RateLimiterStore<K: RateLimitKey> {
    console: Arc<Console>,
    limiters: Mutex<HashMap<String, Arc<KeyedRateLimiter<K>>>>,
}

impl<K: RateLimitKey> RateLimiterStore<K> {
    pub fn new(console: Arc<Console>) -> Self {
        Self {
            console,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches (or creates) the limiter called `name`.
    ///
    /// The first fetch registers both variables with `defaults` unless they
    /// were already set; every fetch re-reads them and updates the limiter.
    pub fn get_rate_limiter(
        &self,
        name: &str,
        defaults: RateLimiterDefaults,
    ) -> Arc<KeyedRateLimiter<K>> {
        let rate_var = rate_variable(name);
        let burst_var = burst_variable(name);

        let limiter = {
            let mut limiters = self.limiters.lock();
            let limiter = limiters.entry(name.to_string()).or_insert_with(|| {
                self.console
                    .register_variable(&rate_var, &defaults.rate.to_string(), false);
                self.console
                    .register_variable(&burst_var, &defaults.burst.to_string(), false);
                Arc::new(KeyedRateLimiter::new(defaults.rate, defaults.burst))
            });
            Arc::clone(limiter)
        };

        let rate = self.console.get_f64(&rate_var).unwrap_or(defaults.rate);
        let burst = self.console.get_f64(&burst_var).unwrap_or(defaults.burst);
        limiter.update(rate, burst);

        limiter
    }

    pub fn len(&self) -> usize {
        self.limiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.lock().is_empty()
    }
}
