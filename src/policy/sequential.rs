use std::sync::Arc;

use super::Policy;
use crate::upstream::UpstreamHost;

/// First live host in configured order.
pub struct Sequential;

impl Policy for Sequential {
    fn select<'a>(&self, pool: &'a [Arc<UpstreamHost>]) -> Option<&'a Arc<UpstreamHost>> {
        pool.iter().find(|h| !h.down())
    }
}
