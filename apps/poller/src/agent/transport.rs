//! Socket layer for agent checks: TCP connects and rustls handshakes.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tracing::debug;

use crate::error::CheckError;
use crate::item::{CertificateTls, TlsConnect};

/// Byte stream an agent check talks over
pub trait AgentIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AgentIo for T {}

pub type AgentStream = Box<dyn AgentIo>;

/// Parameters of a secure handshake towards one interface
#[derive(Clone)]
pub struct SecureSession {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession").field("server_name", &self.server_name).finish_non_exhaustive()
    }
}

/// Opens transports for agent checks
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolves once the connection is writable
    async fn connect(&self, addr: &str, port: u16) -> io::Result<AgentStream>;

    /// Drives the secure handshake to completion over an open stream
    async fn secure(&self, stream: AgentStream, session: &SecureSession) -> io::Result<AgentStream>;
}

/// Plain TCP connector with optional source address
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    source_ip: Option<IpAddr>,
}

impl TcpConnector {
    pub fn new(source_ip: Option<IpAddr>) -> Self {
        Self { source_ip }
    }

    async fn connect_addr(&self, target: SocketAddr) -> io::Result<TcpStream> {
        let Some(source_ip) = self.source_ip else {
            return TcpStream::connect(target).await;
        };

        let socket = if target.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.bind(SocketAddr::new(source_ip, 0))?;
        socket.connect(target).await
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str, port: u16) -> io::Result<AgentStream> {
        let mut last_error = None;

        for target in lookup_host((addr, port)).await? {
            match self.connect_addr(target).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    debug!(%target, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve [{addr}]"))
        }))
    }

    async fn secure(&self, stream: AgentStream, session: &SecureSession) -> io::Result<AgentStream> {
        let connector = TlsConnector::from(session.config.clone());
        let stream = connector.connect(session.server_name.clone(), stream).await?;
        Ok(Box::new(stream))
    }
}

/// Cache of TLS client configurations keyed by certificate material
#[derive(Default)]
pub struct TlsRegistry {
    configs: HashMap<CertificateTls, Arc<ClientConfig>>,
}

impl TlsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the handshake needed for a host, if any
    ///
    /// Missing or unreadable material is a configuration error, reported
    /// before any connection is attempted.
    pub fn session(&mut self, tls: &TlsConnect, addr: &str) -> Result<Option<SecureSession>, CheckError> {
        let material = match tls {
            TlsConnect::Unencrypted => return Ok(None),
            TlsConnect::Psk(_) => {
                return Err(CheckError::config(
                    "A TLS PSK connection is configured to be used with agent but PSK is not supported \
                     by this poller.",
                ));
            }
            TlsConnect::Certificate(material) => material,
        };

        let config = match self.configs.get(material) {
            Some(config) => config.clone(),
            None => {
                let config = Arc::new(build_client_config(material)?);
                self.configs.insert(material.clone(), config.clone());
                config
            }
        };

        let server_name = ServerName::try_from(addr)
            .map(|name| name.to_owned())
            .map_err(|e| CheckError::config(format!("Invalid TLS server name \"{addr}\": {e}")))?;

        Ok(Some(SecureSession { config, server_name }))
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

fn build_client_config(material: &CertificateTls) -> Result<ClientConfig, CheckError> {
    let tls_error = |what: &str, e: &dyn std::fmt::Display| CheckError::config(format!("Cannot {what}: {e}"));

    let mut roots = RootCertStore::empty();
    match &material.ca_file {
        Some(path) => {
            let certs = CertificateDer::pem_file_iter(path)
                .map_err(|e| tls_error(&format!("read CA file {}", path.display()), &e))?;
            for cert in certs {
                let cert = cert.map_err(|e| tls_error(&format!("parse CA file {}", path.display()), &e))?;
                roots.add(cert).map_err(|e| tls_error("add CA certificate", &e))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("select TLS versions", &e))?
        .with_root_certificates(roots);

    match (&material.cert_file, &material.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let chain = CertificateDer::pem_file_iter(cert_file)
                .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
                .map_err(|e| tls_error(&format!("read certificate file {}", cert_file.display()), &e))?;
            let key = PrivateKeyDer::from_pem_file(key_file)
                .map_err(|e| tls_error(&format!("read key file {}", key_file.display()), &e))?;
            builder.with_client_auth_cert(chain, key).map_err(|e| tls_error("use client certificate", &e))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(CheckError::config("TLS certificate and key files must be configured together")),
    }
}
