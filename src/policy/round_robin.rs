use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::Policy;
use crate::upstream::UpstreamHost;

/// Rotates through the pool, skipping hosts that are down.
pub struct RoundRobin {
    current: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for RoundRobin {
    fn select<'a>(&self, pool: &'a [Arc<UpstreamHost>]) -> Option<&'a Arc<UpstreamHost>> {
        if pool.is_empty() {
            return None;
        }
        let start = self.current.fetch_add(1, Ordering::Relaxed) % pool.len();
        for i in 0..pool.len() {
            let host = &pool[(start + i) % pool.len()];
            if !host.down() {
                return Some(host);
            }
        }
        None
    }
}
