//! Listener setup shared by the network transports.

use std::net::SocketAddr;
use std::time::Duration;

use lockstep_core::TransportConfig;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::TransportError;

/// Where and how an engine server listens.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Requested `host:port`; port 0 picks any free port
    pub address: String,
    /// Further consecutive ports tried when the requested one is taken
    pub bind_retries: u16,
    /// Registration listener to report the bound address to
    pub registration_address: Option<String>,
    /// Timeout of the registration request
    pub request_timeout: Duration,
    /// Wait for the backend lock before a command fails
    pub lock_timeout: Duration,
}

impl ServerOptions {
    pub fn new(address: impl Into<String>) -> Self {
        let defaults = TransportConfig::default();
        Self {
            address: address.into(),
            bind_retries: 0,
            registration_address: None,
            request_timeout: Duration::from_secs(10),
            lock_timeout: defaults.registry_lock_timeout,
        }
    }

    /// Options taking retries and timeouts from the transport config.
    pub fn from_config(address: impl Into<String>, config: &TransportConfig) -> Self {
        Self {
            address: address.into(),
            bind_retries: config.bind_retries,
            registration_address: None,
            request_timeout: config.http_timeout,
            lock_timeout: config.registry_lock_timeout,
        }
    }

    pub fn with_registration(mut self, address: impl Into<String>) -> Self {
        self.registration_address = Some(address.into());
        self
    }

    pub fn with_bind_retries(mut self, retries: u16) -> Self {
        self.bind_retries = retries;
        self
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
///
/// # Errors
///
/// - `TransportError::InvalidAddress` - Missing or non-numeric port
pub fn split_host_port(address: &str) -> Result<(&str, u16), TransportError> {
    let invalid = || TransportError::InvalidAddress {
        address: address.to_string(),
    };
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host, port))
}

/// Binds `address`, moving to the next port while it is taken.
///
/// Port 0 is bound once and left to the OS.
///
/// # Errors
///
/// - `TransportError::InvalidAddress` - Address could not be parsed
/// - `TransportError::Bind` - No port in the range could be bound
pub async fn bind_with_retries(address: &str, retries: u16) -> Result<TcpListener, TransportError> {
    let (host, first_port) = split_host_port(address)?;
    let last_port = if first_port == 0 {
        0
    } else {
        first_port.saturating_add(retries)
    };

    let mut attempts = 0;
    let mut port = first_port;
    loop {
        attempts += 1;
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                if port != first_port {
                    debug!(requested = first_port, bound = port, "Requested port was taken");
                }
                return Ok(listener);
            }
            Err(source) if port >= last_port => {
                return Err(TransportError::Bind {
                    address: address.to_string(),
                    attempts,
                    source,
                });
            }
            Err(_) => port += 1,
        }
    }
}

/// A running engine server task.
///
/// Dropping the handle leaves the server running; call [`stop`](Self::stop)
/// to end it.
#[derive(Debug)]
pub struct ServerHandle {
    engine: String,
    address: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub(crate) fn new(
        engine: impl Into<String>,
        address: SocketAddr,
        task: JoinHandle<()>,
    ) -> Self {
        let engine = engine.into();
        info!(engine = %engine, %address, "Engine server listening");
        Self {
            engine,
            address,
            task,
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Address actually bound, after port retries.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops accepting requests.
    pub fn stop(self) {
        debug!(engine = %self.engine, "Stopping engine server");
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("localhost:9002").unwrap(), ("localhost", 9002));
        assert_eq!(split_host_port("[::1]:80").unwrap(), ("::1", 80));
        assert!(split_host_port("localhost").is_err());
        assert!(split_host_port(":80").is_err());
        assert!(split_host_port("host:http").is_err());
    }

    #[tokio::test]
    async fn test_bind_moves_past_taken_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        // The next port may itself be taken on a busy host, so allow a few.
        let listener = bind_with_retries(&format!("127.0.0.1:{port}"), 8)
            .await
            .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_bind_without_retries_fails_on_taken_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap().to_string();

        let err = bind_with_retries(&address, 0).await.unwrap_err();
        assert!(matches!(err, TransportError::Bind { attempts: 1, .. }));
    }
}
