//! Backend pool and selection strategies
//!
//! The pool is an ordered, fixed set of backends. Order matters: it is the
//! round-robin sequence and the tie-break order for least-connections.

use crate::backend::{Backend, BackendSnapshot};
use crate::pool::ConnectionPool;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cycle through backends in pool order, skipping dead ones
    #[default]
    RoundRobin,
    /// Pick the alive backend with the fewest in-flight requests
    LeastConnections,
}

impl Strategy {
    /// Pick a backend from `pool`, or None when no backend is alive
    pub fn select(&self, pool: &BackendPool) -> Option<Arc<Backend>> {
        match self {
            Strategy::RoundRobin => round_robin(pool),
            Strategy::LeastConnections => least_connections(pool),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::RoundRobin => write!(f, "round_robin"),
            Strategy::LeastConnections => write!(f, "least_connections"),
        }
    }
}

/// Advance the cursor once per call, then take the first alive backend at or
/// after `cursor mod N`, wrapping.
fn round_robin(pool: &BackendPool) -> Option<Arc<Backend>> {
    let backends = pool.backends();
    let len = backends.len() as u64;
    if len == 0 {
        return None;
    }

    let start = pool.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1) % len;
    (0..len)
        .map(|offset| &backends[((start + offset) % len) as usize])
        .find(|backend| backend.is_alive())
        .cloned()
}

/// Lowest in-flight count among alive backends; the earliest pool index wins
/// ties.
fn least_connections(pool: &BackendPool) -> Option<Arc<Backend>> {
    let mut selected: Option<(&Arc<Backend>, i64)> = None;

    for backend in pool.backends().iter().filter(|b| b.is_alive()) {
        let conns = backend.active_connections();
        match selected {
            Some((_, least)) if conns >= least => {}
            _ => selected = Some((backend, conns)),
        }
    }

    selected.map(|(backend, _)| Arc::clone(backend))
}

/// Pool-wide status, for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub strategy: Strategy,
    pub healthy: usize,
    pub total: usize,
    pub backends: Vec<BackendSnapshot>,
}

/// Fixed, ordered set of backends sharing one selection strategy
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    cursor: AtomicU64,
    strategy: Strategy,
}

impl BackendPool {
    pub fn new(backends: Vec<Arc<Backend>>, strategy: Strategy) -> Self {
        Self {
            backends,
            cursor: AtomicU64::new(0),
            strategy,
        }
    }

    /// Build a pool from address strings.
    ///
    /// Addresses that fail to parse are left out of the pool with a warning
    /// instead of aborting startup.
    pub fn from_addresses<S: AsRef<str>>(
        addresses: &[S],
        strategy: Strategy,
        transport: Arc<ConnectionPool>,
    ) -> Self {
        let mut backends = Vec::with_capacity(addresses.len());

        for address in addresses {
            let address = address.as_ref();
            match Backend::parse(address, Arc::clone(&transport)) {
                Ok(backend) => {
                    debug!(backend = %backend.display_address(), "Added backend to pool");
                    backends.push(Arc::new(backend));
                }
                Err(e) => {
                    warn!(address, error = %e, "Skipping backend with unparseable address");
                }
            }
        }

        info!(
            %strategy,
            total_backends = backends.len(),
            skipped = addresses.len() - backends.len(),
            "Backend pool ready"
        );

        Self::new(backends, strategy)
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select the next backend under the pool's strategy
    pub fn next_backend(&self) -> Option<Arc<Backend>> {
        let selected = self.strategy.select(self);
        if let Some(ref backend) = selected {
            debug!(
                backend = %backend.display_address(),
                strategy = %self.strategy,
                active_connections = backend.active_connections(),
                "Selected backend"
            );
        }
        selected
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }

    pub fn total_count(&self) -> usize {
        self.backends.len()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            strategy: self.strategy,
            healthy: self.healthy_count(),
            total: self.total_count(),
            backends: self.backends.iter().map(|b| b.snapshot()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use std::collections::HashMap;

    fn test_pool(count: u16, strategy: Strategy) -> BackendPool {
        let transport = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let addresses: Vec<String> = (0..count)
            .map(|i| format!("127.0.0.1:{}", 10001 + i))
            .collect();
        BackendPool::from_addresses(&addresses, strategy, transport)
    }

    fn port_of(backend: &Arc<Backend>) -> u16 {
        backend.address().port_u16().unwrap()
    }

    fn next_port(pool: &BackendPool) -> Option<u16> {
        pool.next_backend().map(|b| port_of(&b))
    }

    #[test]
    fn test_round_robin() {
        let pool = test_pool(3, Strategy::RoundRobin);

        assert_eq!(next_port(&pool), Some(10002));
        assert_eq!(next_port(&pool), Some(10003));
        assert_eq!(next_port(&pool), Some(10001)); // wraps around
        assert_eq!(next_port(&pool), Some(10002));
    }

    #[test]
    fn test_round_robin_fairness() {
        let pool = test_pool(4, Strategy::RoundRobin);
        let mut counts: HashMap<u16, usize> = HashMap::new();
        let mut sequence = Vec::new();

        for _ in 0..400 {
            let port = next_port(&pool).unwrap();
            *counts.entry(port).or_default() += 1;
            sequence.push(port);
        }

        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 100));
        for window in sequence.windows(2) {
            let expected = if window[0] == 10004 { 10001 } else { window[0] + 1 };
            assert_eq!(window[1], expected);
        }
    }

    #[test]
    fn test_round_robin_skips_dead_backend() {
        let pool = test_pool(3, Strategy::RoundRobin);
        pool.backends()[1].set_alive(false);

        // The dead backend's turn goes to the next alive one in pool order
        let picks: Vec<u16> = (0..6).map(|_| next_port(&pool).unwrap()).collect();
        assert_eq!(picks, vec![10003, 10003, 10001, 10003, 10003, 10001]);
        assert!(!picks.contains(&10002));
    }

    #[test]
    fn test_round_robin_advances_even_when_all_dead() {
        let pool = test_pool(3, Strategy::RoundRobin);
        for backend in pool.backends() {
            backend.set_alive(false);
        }

        assert_eq!(next_port(&pool), None);
        assert_eq!(next_port(&pool), None);

        pool.backends()[0].set_alive(true);
        pool.backends()[1].set_alive(true);
        pool.backends()[2].set_alive(true);

        // Two failed selections still advanced the cursor, so index 0 is next
        assert_eq!(next_port(&pool), Some(10001));
        assert_eq!(next_port(&pool), Some(10002));
    }

    #[test]
    fn test_round_robin_cursor_wraps_at_overflow() {
        let pool = test_pool(3, Strategy::RoundRobin);
        pool.cursor.store(u64::MAX, Ordering::Relaxed);

        // The counter wraps to 0 and the cycle carries on from there
        assert_eq!(next_port(&pool), Some(10001));
        assert_eq!(next_port(&pool), Some(10002));
        assert_eq!(next_port(&pool), Some(10003));
    }

    #[test]
    fn test_least_connections() {
        let pool = test_pool(3, Strategy::LeastConnections);
        let backends = pool.backends();
        let mut guards = Vec::new();
        for (backend, count) in backends.iter().zip([3, 1, 2]) {
            for _ in 0..count {
                guards.push(backend.track());
            }
        }

        let selected = pool.next_backend().unwrap();
        assert_eq!(port_of(&selected), 10002);

        // Now [3, 2, 2]: the tie goes to the lower pool index
        guards.push(selected.track());
        assert_eq!(next_port(&pool), Some(10002));

        drop(guards);
        assert!(backends.iter().all(|b| b.active_connections() == 0));
    }

    #[test]
    fn test_least_connections_first_wins_when_all_equal() {
        let pool = test_pool(3, Strategy::LeastConnections);
        assert_eq!(next_port(&pool), Some(10001));
        assert_eq!(next_port(&pool), Some(10001));
    }

    #[test]
    fn test_least_connections_ignores_dead_backends() {
        let pool = test_pool(3, Strategy::LeastConnections);
        let backends = pool.backends();
        let _busy = [backends[1].track(), backends[1].track()];
        backends[0].set_alive(false);

        assert_eq!(next_port(&pool), Some(10003));

        backends[2].set_alive(false);
        assert_eq!(next_port(&pool), Some(10002));

        backends[1].set_alive(false);
        assert_eq!(next_port(&pool), None);
    }

    #[test]
    fn test_selection_never_changes_liveness() {
        for strategy in [Strategy::RoundRobin, Strategy::LeastConnections] {
            let pool = test_pool(3, strategy);
            pool.backends()[2].set_alive(false);
            for _ in 0..10 {
                pool.next_backend();
            }
            let alive: Vec<bool> = pool.backends().iter().map(|b| b.is_alive()).collect();
            assert_eq!(alive, vec![true, true, false]);
        }
    }

    #[test]
    fn test_empty_pool() {
        for strategy in [Strategy::RoundRobin, Strategy::LeastConnections] {
            let pool = test_pool(0, strategy);
            assert!(pool.next_backend().is_none());
        }
    }

    #[test]
    fn test_unparseable_addresses_are_skipped() {
        let transport = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let pool = BackendPool::from_addresses(
            &["127.0.0.1:4000", "https://127.0.0.1:4001", "127.0.0.1:4002"],
            Strategy::RoundRobin,
            transport,
        );

        assert_eq!(pool.total_count(), 2);
        assert_eq!(next_port(&pool), Some(4002));
        assert_eq!(next_port(&pool), Some(4000));
    }

    #[test]
    fn test_concurrent_round_robin_is_fair() {
        let pool = Arc::new(test_pool(4, Strategy::RoundRobin));
        let counts = parking_lot::Mutex::new(HashMap::<u16, usize>::new());

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let port = next_port(&pool).unwrap();
                        *counts.lock().entry(port).or_default() += 1;
                    }
                });
            }
        });

        let counts = counts.into_inner();
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 1000));
    }

    #[test]
    fn test_pool_status() {
        let pool = test_pool(2, Strategy::LeastConnections);
        pool.backends()[0].set_alive(false);

        let status = pool.status();
        assert_eq!(status.strategy, Strategy::LeastConnections);
        assert_eq!(status.healthy, 1);
        assert_eq!(status.total, 2);
        assert_eq!(status.backends[0].address, "http://127.0.0.1:10001");
        assert!(!status.backends[0].alive);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["strategy"], "least_connections");
    }

    #[test]
    fn test_strategy_display() {
        assert_eq!(Strategy::RoundRobin.to_string(), "round_robin");
        assert_eq!(Strategy::LeastConnections.to_string(), "least_connections");
    }
}
