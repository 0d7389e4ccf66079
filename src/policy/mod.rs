//! Pluggable upstream host selectors.

pub mod random;
pub mod round_robin;
pub mod sequential;
pub mod spray;

use std::sync::Arc;

use crate::upstream::UpstreamHost;

pub use self::random::Random;
pub use self::round_robin::RoundRobin;
pub use self::sequential::Sequential;
pub use self::spray::Spray;

/// Picks one host out of a pool. Implementations see the full pool and are
/// responsible for filtering out down hosts themselves; `None` means "no
/// live host matched".
pub trait Policy: Send + Sync {
    fn select<'a>(&self, pool: &'a [Arc<UpstreamHost>]) -> Option<&'a Arc<UpstreamHost>>;
}

/// Resolves a configured policy name.
pub fn from_name(name: &str) -> Option<Box<dyn Policy>> {
    match name {
        "random" => Some(Box::new(Random)),
        "round_robin" => Some(Box::new(RoundRobin::new())),
        "sequential" => Some(Box::new(Sequential)),
        _ => None,
    }
}
