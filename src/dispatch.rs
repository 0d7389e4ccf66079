//! The per-query entry point: match a group, select a host, exchange.

use std::sync::Arc;

use hickory_proto::op::Message;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ConfigError, ExchangeError};
use crate::group::Group;
use crate::stats::StatsCollector;
use crate::transport::MIN_MSG_SIZE;

/// Protocol tag the host framework saw the query arrive on. `Dns` is the
/// neutral value for callers without a transport opinion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryProto {
    Dns,
    Udp,
    Tcp,
}

/// Everything the core needs to know about one incoming query.
pub struct QueryInfo {
    message: Message,
    proto: QueryProto,
    name: String,
    udp_size: u16,
}

impl QueryInfo {
    /// Wraps an incoming request. The queried name is taken from the first
    /// question and normalized once; the root zone stays `"."`.
    pub fn new(message: Message, proto: QueryProto, udp_size: u16) -> Self {
        let name = match message.queries().first() {
            Some(query) => {
                let mut name = query.name().to_string();
                if name.len() > 1 && name.ends_with('.') {
                    name.pop();
                }
                name.make_ascii_lowercase();
                name
            }
            None => String::new(),
        };
        Self {
            message,
            proto,
            name,
            udp_size: udp_size.max(MIN_MSG_SIZE),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn proto(&self) -> QueryProto {
        self.proto
    }

    /// Normalized queried name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn udp_size(&self) -> u16 {
        self.udp_size
    }
}

/// Iterates groups in configured order and forwards each query to the
/// first one that matches.
pub struct Dispatcher {
    groups: Vec<Arc<Group>>,
    stats: Arc<StatsCollector>,
}

impl Dispatcher {
    /// Builds every group from the configuration. Must be called from
    /// within a runtime when stats logging is enabled.
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let stats = StatsCollector::new(cfg.stats_log_interval_secs);
        let groups = cfg
            .groups
            .iter()
            .map(|group| Group::from_config(group, stats.clone()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { groups, stats })
    }

    pub fn new(groups: Vec<Arc<Group>>, stats: Arc<StatsCollector>) -> Self {
        Self { groups, stats }
    }

    pub fn groups(&self) -> &[Arc<Group>] {
        &self.groups
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    /// Starts every group: initial name loads, reload tickers, health
    /// checking and connection managers.
    pub async fn start(&self) {
        for group in &self.groups {
            group.start().await;
        }
    }

    pub async fn stop(&self) {
        for group in &self.groups {
            group.stop().await;
        }
    }

    /// Forwards the query through the first matching group. `None` means
    /// the query is unserved here and the host framework should hand it to
    /// its next handler.
    pub async fn dispatch(&self, query: &QueryInfo) -> Option<Message> {
        let group = self.groups.iter().find(|g| g.matches(query.name()))?;
        self.stats.inc_matched();

        let Some(host) = group.health().select() else {
            debug!("no upstream host available for {:?}", query.name());
            self.stats.inc_fallthrough();
            return None;
        };

        match host.exchange(query).await {
            Ok(reply) => {
                self.stats.inc_forwarded();
                Some(reply)
            }
            Err(ExchangeError::CachedConnClosed) => {
                // The pooled connection died underneath us; one fresh
                // attempt, possibly on another host.
                self.stats.inc_conn_retry();
                debug!(
                    "cached connection to {} was closed, retrying once",
                    host.addr()
                );
                let Some(host) = group.health().select() else {
                    self.stats.inc_fallthrough();
                    return None;
                };
                match host.exchange(query).await {
                    Ok(reply) => {
                        self.stats.inc_forwarded();
                        Some(reply)
                    }
                    Err(err) => {
                        warn!("retried exchange with {} failed: {}", host.addr(), err);
                        self.stats.inc_fallthrough();
                        None
                    }
                }
            }
            Err(err) => {
                warn!("exchange with {} failed: {}", host.addr(), err);
                self.stats.inc_fallthrough();
                None
            }
        }
    }
}
