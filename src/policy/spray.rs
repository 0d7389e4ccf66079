use std::sync::Arc;

use rand::Rng;

use super::Policy;
use crate::upstream::UpstreamHost;

/// Last-resort selector used when every host is down: picks a random host
/// regardless of its health, on the theory that a desperate attempt beats
/// refusing the query.
pub struct Spray;

impl Policy for Spray {
    fn select<'a>(&self, pool: &'a [Arc<UpstreamHost>]) -> Option<&'a Arc<UpstreamHost>> {
        if pool.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..pool.len());
        Some(&pool[idx])
    }
}
