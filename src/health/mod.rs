//! Periodic liveness probing and host selection for one group.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::policy::{Policy, Random, Spray};
use crate::stats::StatsCollector;
use crate::upstream::UpstreamHost;

pub(crate) const DEFAULT_HC_INTERVAL: Duration = Duration::from_millis(2000);
pub(crate) const MIN_HC_INTERVAL: Duration = Duration::from_secs(1);

/// Health-check bundle: the host pool, the selection policies and the
/// probe ticker.
pub struct HealthCheck {
    hosts: Vec<Arc<UpstreamHost>>,
    policy: Option<Box<dyn Policy>>,
    spray: Option<Spray>,
    check_interval: Duration,
    stats: Arc<StatsCollector>,

    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HealthCheck {
    pub fn new(
        hosts: Vec<Arc<UpstreamHost>>,
        policy: Option<Box<dyn Policy>>,
        spray: Option<Spray>,
        check_interval: Duration,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            hosts,
            policy,
            spray,
            check_interval,
            stats,
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn hosts(&self) -> &[Arc<UpstreamHost>] {
        &self.hosts
    }

    /// Starts each host's connection manager and, unless disabled, the
    /// probe ticker. The first sweep runs immediately.
    pub fn start(&self) {
        for host in &self.hosts {
            host.transport().start();
        }

        if self.check_interval.is_zero() {
            return;
        }

        let hosts = self.hosts.clone();
        let interval = self.check_interval;
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            sweep(&hosts);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep(&hosts),
                    _ = cancel.cancelled() => return,
                }
            }
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Stops the probe ticker, waits for it, then shuts down every host's
    /// connection manager.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        for host in &self.hosts {
            host.transport().stop().await;
        }
    }

    /// Selects a host for the next exchange:
    ///
    /// 1. a single-host pool short-circuits (down + no spray = none);
    /// 2. when every host is down, only spray can still pick one;
    /// 3. with no policy configured, random selection is the default;
    /// 4. a policy that comes up empty falls back to spray.
    pub fn select(&self) -> Option<&Arc<UpstreamHost>> {
        let pool = &self.hosts;
        if pool.len() == 1 {
            let host = &pool[0];
            if host.down() && self.spray.is_none() {
                return None;
            }
            return Some(host);
        }

        if pool.iter().all(|h| h.down()) {
            self.stats.inc_all_down();
            debug!("all upstream hosts down");
            return match &self.spray {
                Some(spray) => spray.select(pool),
                None => None,
            };
        }

        let picked = match &self.policy {
            Some(policy) => policy.select(pool),
            None => Random.select(pool),
        };
        if picked.is_some() {
            return picked;
        }

        match &self.spray {
            Some(spray) => spray.select(pool),
            None => None,
        }
    }
}

fn sweep(hosts: &[Arc<UpstreamHost>]) {
    for host in hosts {
        let host = host.clone();
        tokio::spawn(async move {
            host.check().await;
        });
    }
}
