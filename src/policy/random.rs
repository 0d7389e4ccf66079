use std::sync::Arc;

use rand::Rng;

use super::Policy;
use crate::upstream::UpstreamHost;

/// Uniform pick over the hosts that are up. This is also the default when
/// no policy is configured.
pub struct Random;

impl Policy for Random {
    fn select<'a>(&self, pool: &'a [Arc<UpstreamHost>]) -> Option<&'a Arc<UpstreamHost>> {
        let live: Vec<&Arc<UpstreamHost>> = pool.iter().filter(|h| !h.down()).collect();
        if live.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..live.len());
        Some(live[idx])
    }
}
