use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// TLS client side of the relay hop, trusting the platform's root store.
#[derive(Clone)]
pub struct TlsWrapper {
    connector: TlsConnector,
}

impl TlsWrapper {
    /// Create new TLS wrapper with native certificate store
    pub fn new() -> Result<Self> {
        let native_certs = rustls_native_certs::load_native_certs()
            .map_err(|e| Error::Tls(format!("loading native certificates: {}", e)))?;
        let der: Vec<Vec<u8>> = native_certs.into_iter().map(|cert| cert.0).collect();

        let mut root_store = RootCertStore::empty();
        let (added, ignored) = root_store.add_parsable_certificates(&der);
        if added == 0 {
            return Err(Error::Tls("no usable root certificates".to_string()));
        }
        tracing::debug!(added, ignored, "loaded native root certificates");

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Ok(Self::from_config(Arc::new(config)))
    }

    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }

    /// Runs the TLS handshake over an established TCP stream.
    pub async fn connect(&self, stream: TcpStream, server_name: &str) -> Result<TlsStream<TcpStream>> {
        let name = ServerName::try_from(server_name)
            .map_err(|_| Error::Tls(format!("invalid server name {:?}", server_name)))?;
        self.connector
            .connect(name, stream)
            .await
            .map_err(|e| Error::Tls(format!("handshake with {}: {}", server_name, e)))
    }
}
