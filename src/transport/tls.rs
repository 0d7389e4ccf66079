//! rustls client configuration for TCP-TLS upstreams.

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};

use crate::error::ConfigError;

/// Everything a dial needs to open a TLS connection: the (group-wide)
/// client configuration and the per-host server name.
#[derive(Clone)]
pub struct TlsSettings {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Builds the shared client configuration from optional cert/key/CA paths.
/// Without a CA file the Mozilla root store is used.
pub(crate) fn client_config(
    cert: Option<&Path>,
    key: Option<&Path>,
    ca: Option<&Path>,
) -> Result<Arc<ClientConfig>, ConfigError> {
    let mut roots = RootCertStore::empty();
    match ca {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (cert, key) {
        (Some(cert_path), Some(key_path)) => {
            builder.with_client_auth_cert(load_certs(cert_path)?, load_key(key_path)?)?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Resolves the SNI for one host: the endpoint's `@name` wins over the
/// group's `tls_servername`; with neither, the upstream IP is used.
pub(crate) fn server_name(
    host_override: Option<&str>,
    group_name: Option<&str>,
    ip: IpAddr,
) -> Result<ServerName<'static>, ConfigError> {
    match host_override.or(group_name) {
        Some(name) => ServerName::try_from(name.to_string())
            .map_err(|_| ConfigError::InvalidServerName(name.to_string())),
        None => Ok(ServerName::IpAddress(ip.into())),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::TlsFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::TlsFile {
            path: path.to_path_buf(),
            source,
        })
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::TlsFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| ConfigError::TlsFile {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| ConfigError::TlsMissingKey {
            path: PathBuf::from(path),
        })
}
