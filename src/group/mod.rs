//! A forward group: the match predicate over its name sources and the
//! health-checked upstream pool behind it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Endpoint, GroupConfig, Scheme};
use crate::domain::{self, DomainSet};
use crate::error::ConfigError;
use crate::health::{HealthCheck, MIN_HC_INTERVAL};
use crate::namelist::{
    NameList, NameSource, MIN_PATH_RELOAD, MIN_URL_READ_TIMEOUT, MIN_URL_RELOAD,
};
use crate::policy::{self, Policy, Spray};
use crate::stats::StatsCollector;
use crate::transport::{
    client_config, server_name, TlsSettings, Transport, TransportOptions, MIN_EXPIRE_INTERVAL,
};
use crate::upstream::{default_down_fn, UpstreamHost};

/// One reloadable forward group.
pub struct Group {
    match_any: bool,
    name_list: Arc<NameList>,
    inline: DomainSet,
    ignored: DomainSet,
    health: HealthCheck,

    cancel: CancellationToken,
    reload_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Group {
    /// Builds a group from its configuration, refusing anything the
    /// directive table forbids.
    pub fn from_config(cfg: &GroupConfig, stats: Arc<StatsCollector>) -> Result<Self, ConfigError> {
        if cfg.from.is_empty() {
            return Err(ConfigError::EmptyFrom);
        }
        let match_any = cfg.from.iter().any(|f| f == ".");
        if match_any && cfg.from.len() > 1 {
            return Err(ConfigError::MixedMatchAny);
        }

        let path_reload = checked_interval("path_reload", cfg.path_reload(), MIN_PATH_RELOAD)?;
        let url_reload = checked_interval("url_reload", cfg.url_reload(), MIN_URL_RELOAD)?;
        let url_read_timeout = cfg.url_read_timeout();
        if url_read_timeout < MIN_URL_READ_TIMEOUT {
            return Err(ConfigError::IntervalTooShort {
                directive: "url_read_timeout",
                min: MIN_URL_READ_TIMEOUT,
            });
        }
        let check_interval = checked_interval("health_check", cfg.health_check(), MIN_HC_INTERVAL)?;
        let expire = checked_interval("expire", cfg.expire(), MIN_EXPIRE_INTERVAL)?;

        let mut inline = DomainSet::new();
        let mut sources = Vec::new();
        for entry in &cfg.from {
            if entry == "." {
                continue;
            }
            if entry.contains("://") {
                let url = Url::parse(entry).map_err(|source| ConfigError::InvalidUrl {
                    url: entry.clone(),
                    source,
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
                }
                sources.push(NameSource::Url(url));
            } else if entry.contains('/') {
                sources.push(NameSource::Path(PathBuf::from(entry)));
            } else if !inline.add(entry) {
                return Err(ConfigError::InvalidDomain(entry.clone()));
            }
        }

        let mut ignored = DomainSet::new();
        for name in &cfg.except {
            if !ignored.add(name) {
                warn!("{name:?} isn't a domain name");
            }
        }

        // `except` takes precedence over an inline name, so listing the
        // same name in both is a contradiction.
        for name in inline.iter() {
            if ignored.matches(name) {
                return Err(ConfigError::InlineConflict(name.to_string()));
            }
        }

        let (force_tcp, prefer_udp) = if cfg.force_tcp && cfg.prefer_udp {
            warn!("force_tcp: prefer_udp invalidated");
            (true, false)
        } else {
            (cfg.force_tcp, cfg.prefer_udp)
        };

        let policy: Option<Box<dyn Policy>> = match &cfg.policy {
            Some(name) => Some(
                policy::from_name(name).ok_or_else(|| ConfigError::UnknownPolicy(name.clone()))?,
            ),
            None => None,
        };
        let spray = cfg.spray.then_some(Spray);

        if cfg.to.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }
        let endpoints = cfg
            .to
            .iter()
            .map(|raw| Endpoint::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let group_sni = match &cfg.tls_servername {
            Some(name) => Some(
                domain::normalize(name)
                    .ok_or_else(|| ConfigError::InvalidServerName(name.clone()))?,
            ),
            None => None,
        };
        let tls_config = if endpoints.iter().any(|ep| ep.scheme == Scheme::Tls) {
            let files = cfg.tls.clone().unwrap_or_default();
            Some(client_config(
                files.cert.as_deref(),
                files.key.as_deref(),
                files.ca.as_deref(),
            )?)
        } else {
            None
        };

        let recursion_desired = !cfg.no_rec;
        let mut hosts = Vec::with_capacity(endpoints.len());
        for ep in &endpoints {
            // The client config is shared; the server name is resolved per
            // host so an `@name` override cannot leak across hosts.
            let tls = match (ep.scheme, &tls_config) {
                (Scheme::Tls, Some(config)) => Some(TlsSettings {
                    config: config.clone(),
                    server_name: server_name(
                        ep.tls_server_name.as_deref(),
                        group_sni.as_deref(),
                        ep.addr.ip(),
                    )?,
                }),
                _ => None,
            };
            let transport = Transport::new(TransportOptions {
                expire: Some(expire),
                recursion_desired,
                force_tcp,
                prefer_udp,
                tls,
            });
            let host = Arc::new(UpstreamHost::new(
                ep.addr,
                ep.scheme,
                transport,
                Some(default_down_fn(cfg.max_fails)),
                stats.clone(),
            ));
            debug!("upstream: {host}");
            hosts.push(host);
        }

        // Match-any groups keep no reloadable sets, and a ticker with no
        // items of its kind would only spin.
        let (path_reload, url_reload) = if match_any {
            (Duration::ZERO, Duration::ZERO)
        } else {
            let has_path = sources.iter().any(|s| matches!(s, NameSource::Path(_)));
            let has_url = sources.iter().any(|s| matches!(s, NameSource::Url(_)));
            (
                if has_path { path_reload } else { Duration::ZERO },
                if has_url { url_reload } else { Duration::ZERO },
            )
        };
        let name_list = Arc::new(NameList::new(
            sources,
            path_reload,
            url_reload,
            url_read_timeout,
        ));

        if !inline.is_empty() {
            info!("inline: {} name(s)", inline.len());
        }

        Ok(Self {
            match_any,
            name_list,
            inline,
            ignored,
            health: HealthCheck::new(hosts, policy, spray, check_interval, stats),
            cancel: CancellationToken::new(),
            reload_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Checks whether this group answers for `name`, which must already be
    /// normalized (lower-cased, no trailing dot except the root zone).
    pub fn matches(&self, name: &str) -> bool {
        if self.match_any {
            let ignored = self.ignored.matches(name);
            if ignored {
                debug!("skip {name:?} since it's ignored");
            }
            return !ignored;
        }

        if !self.name_list.matches(name) && !self.inline.matches(name) {
            return false;
        }

        if self.ignored.matches(name) {
            debug!("skip {name:?} since it's ignored");
            return false;
        }
        true
    }

    pub fn is_match_any(&self) -> bool {
        self.match_any
    }

    pub fn name_list(&self) -> &Arc<NameList> {
        &self.name_list
    }

    pub fn health(&self) -> &HealthCheck {
        &self.health
    }

    /// Loads every name source once, then launches the reload tickers, the
    /// health-check worker and the per-host connection managers.
    pub async fn start(&self) {
        self.name_list.refresh().await;
        let tasks = self.name_list.start(&self.cancel);
        self.reload_tasks.lock().unwrap().extend(tasks);
        self.health.start();
    }

    /// Signals every task started by [`Group::start`] and waits for them.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.reload_tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        self.health.stop().await;
    }
}

fn checked_interval(
    directive: &'static str,
    value: Duration,
    min: Duration,
) -> Result<Duration, ConfigError> {
    if !value.is_zero() && value < min {
        return Err(ConfigError::IntervalTooShort { directive, min });
    }
    Ok(value)
}
