//! DNS redirection core for a host DNS server.
//!
//! Queries are matched against per-group domain lists (inline names, local
//! files and HTTP(S) lists, all reloadable), a healthy upstream is chosen
//! by a configurable policy, and the query is exchanged verbatim over a
//! pooled UDP, TCP or TCP-TLS connection.
//!
//! The crate is a library: the host process builds a [`Dispatcher`] from a
//! [`Config`], calls [`Dispatcher::start`], and feeds each query in as a
//! [`QueryInfo`]. A `None` from [`Dispatcher::dispatch`] means the query is
//! not served here and should fall through to the host's next handler.

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod group;
pub mod health;
pub mod namelist;
pub mod policy;
pub mod stats;
pub mod transport;
pub mod upstream;

pub use config::{Config, Endpoint, GroupConfig, Scheme};
pub use dispatch::{Dispatcher, QueryInfo, QueryProto};
pub use error::{ConfigError, ExchangeError};
pub use group::Group;
