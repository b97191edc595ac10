//! Mutually-authenticated TLS client setup and connection establishment.

use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use tracing::debug;

use crate::{Connection, Dscp, TransportError, WRITE_DEADLINE};

/// Paths and identity for the mutual-TLS client.
#[derive(Clone, Debug)]
pub struct TlsSettings {
    /// CA bundle the server certificate must chain to.
    pub ca_bundle: PathBuf,
    /// Client certificate presented to the server.
    pub client_cert: PathBuf,
    /// Private key for the client certificate.
    pub client_key: PathBuf,
    /// Server name used for SNI and certificate verification.
    pub server_name: String,
}

/// Reusable TLS client configuration.
#[derive(Debug)]
pub struct TlsClient {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsClient {
    /// Builds the client configuration from PEM files on disk.
    pub fn new(settings: &TlsSettings) -> Result<Self, TransportError> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&settings.ca_bundle)? {
            roots
                .add(cert)
                .map_err(|err| TransportError::TlsConfig {
                    path: settings.ca_bundle.clone(),
                    detail: err.to_string(),
                })?;
        }

        let certs = load_certs(&settings.client_cert)?;
        let key = load_key(&settings.client_key)?;
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|err| TransportError::TlsConfig {
                path: settings.client_cert.clone(),
                detail: err.to_string(),
            })?;

        let server_name = ServerName::try_from(settings.server_name.clone())
            .map_err(|_| TransportError::ServerName(settings.server_name.clone()))?;

        Ok(Self {
            config: Arc::new(config),
            server_name,
        })
    }

    /// Dials `addr`, marks the socket, completes the TLS handshake, and
    /// returns the wrapped connection.
    pub fn connect(&self, addr: &str, dscp: Dscp) -> Result<Connection, TransportError> {
        let mut stream = TcpStream::connect(addr).map_err(|source| TransportError::Connect {
            addr: addr.to_owned(),
            source,
        })?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;
        // DSCP must land on the socket before any TLS bytes leave it.
        dscp.apply(&stream).map_err(TransportError::Io)?;
        stream
            .set_write_timeout(Some(WRITE_DEADLINE))
            .map_err(TransportError::Io)?;

        let mut session = ClientConnection::new(Arc::clone(&self.config), self.server_name.clone())
            .map_err(|err| TransportError::Handshake {
                addr: addr.to_owned(),
                source: std::io::Error::other(err.to_string()),
            })?;
        while session.is_handshaking() {
            session
                .complete_io(&mut stream)
                .map_err(|source| TransportError::Handshake {
                    addr: addr.to_owned(),
                    source,
                })?;
        }
        debug!(addr, "TLS session established");
        Connection::tls(stream, session).map_err(TransportError::Io)
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|err| TransportError::TlsConfig {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TransportError::TlsConfig {
            path: path.to_path_buf(),
            detail: err.to_string(),
        })
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path).map_err(|err| TransportError::TlsConfig {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|err| TransportError::TlsConfig {
            path: path.to_path_buf(),
            detail: err.to_string(),
        })?
        .ok_or_else(|| TransportError::TlsConfig {
            path: path.to_path_buf(),
            detail: "no private key found".to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn missing_ca_bundle_is_reported() {
        let settings = TlsSettings {
            ca_bundle: PathBuf::from("/nonexistent/ca.pem"),
            client_cert: PathBuf::from("/nonexistent/cert.pem"),
            client_key: PathBuf::from("/nonexistent/key.pem"),
            server_name: "backup.example".into(),
        };
        let err = TlsClient::new(&settings).unwrap_err();
        assert!(matches!(err, TransportError::TlsConfig { .. }));
    }

    #[test]
    fn empty_key_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        File::create(&ca).unwrap().write_all(b"").unwrap();
        let err = load_key(&ca).unwrap_err();
        assert!(matches!(err, TransportError::TlsConfig { .. }));
    }

    #[test]
    fn invalid_server_name_is_reported() {
        let name = ServerName::try_from("not a hostname".to_owned());
        assert!(name.is_err());
    }
}
