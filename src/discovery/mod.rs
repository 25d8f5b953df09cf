//! Local-network advertisement of the stream endpoint
//!
//! The advertiser only reads the server's bound port and the host address.
//! Registration failures are reported but never stop the stream.

#[cfg(feature = "mdns")]
mod mdns;

#[cfg(feature = "mdns")]
pub use mdns::MdnsRegistry;

use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::config::StreamConfig;
use crate::constants::{SERVICE_TYPE, STREAM_PATH};
use crate::error::{DiscoveryError, NetworkError};

/// What gets published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub instance_name: String,
    pub service_type: String,
    pub address: IpAddr,
    pub port: u16,
    pub attributes: Vec<(String, String)>,
}

/// A naming service the record can be published to
pub trait ServiceRegistry: Send {
    /// Publish `record`, returning the full name used to withdraw it
    fn register(&mut self, record: &ServiceRecord) -> Result<String, DiscoveryError>;

    fn unregister(&mut self, fullname: &str) -> Result<(), DiscoveryError>;

    /// Release the underlying responder
    fn shutdown(&mut self) {}
}

/// TXT attributes announced for a session
pub fn service_attributes(config: &StreamConfig) -> Vec<(String, String)> {
    let mut attributes = vec![("path".to_string(), format!("/{}", STREAM_PATH))];
    if config.has_ar {
        attributes.push(("ar".into(), "true".into()));
    }
    if config.include_depth {
        attributes.push(("depth".into(), "true".into()));
    }
    attributes
}

/// Address of the interface that routes off-host.
///
/// Connecting a UDP socket selects a route without sending anything.
pub fn local_ip() -> Result<IpAddr, NetworkError> {
    let probe: SocketAddr = ([192, 0, 2, 1], 9).into();
    let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(|_| NetworkError::NoLocalAddress)?;
    socket.connect(probe).map_err(|_| NetworkError::NoLocalAddress)?;
    let ip = socket
        .local_addr()
        .map_err(|_| NetworkError::NoLocalAddress)?
        .ip();
    if ip.is_unspecified() {
        return Err(NetworkError::NoLocalAddress);
    }
    Ok(ip)
}

pub struct DiscoveryAdvertiser {
    registry: Box<dyn ServiceRegistry>,
    record: Option<ServiceRecord>,
    fullname: Option<String>,
    reregistered: bool,
}

impl DiscoveryAdvertiser {
    pub fn new(registry: Box<dyn ServiceRegistry>) -> Self {
        Self {
            registry,
            record: None,
            fullname: None,
            reregistered: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.fullname.is_some()
    }

    pub fn record(&self) -> Option<&ServiceRecord> {
        self.record.as_ref()
    }

    /// Publish the stream endpoint. Any earlier registration is withdrawn first.
    pub fn register(
        &mut self,
        name: &str,
        address: IpAddr,
        port: u16,
        attributes: Vec<(String, String)>,
    ) -> Result<(), DiscoveryError> {
        let record = ServiceRecord {
            instance_name: name.to_string(),
            service_type: SERVICE_TYPE.to_string(),
            address,
            port,
            attributes,
        };
        // Kept even on failure so an address change can retry
        self.record = Some(record.clone());
        self.publish(&record)
    }

    fn publish(&mut self, record: &ServiceRecord) -> Result<(), DiscoveryError> {
        let _ = self.unregister();

        tracing::debug!(
            name = %record.instance_name,
            service_type = %record.service_type,
            port = record.port,
            "Registering service"
        );
        match self.registry.register(record) {
            Ok(fullname) => {
                tracing::info!(
                    "Advertising {} at {}:{}",
                    fullname,
                    record.address,
                    record.port
                );
                self.fullname = Some(fullname);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Service registration failed: {}", e);
                Err(e)
            }
        }
    }

    /// Withdraw the record. Idempotent.
    pub fn unregister(&mut self) -> Result<(), DiscoveryError> {
        let Some(fullname) = self.fullname.take() else {
            return Ok(());
        };
        match self.registry.unregister(&fullname) {
            Ok(()) => {
                tracing::info!("Service {} withdrawn", fullname);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Service unregistration failed: {}", e);
                Err(e)
            }
        }
    }

    /// React to a new host address. Re-registers at most once per session;
    /// returns whether a re-registration happened.
    pub fn on_address_changed(&mut self, address: IpAddr) -> Result<bool, DiscoveryError> {
        let Some(mut record) = self.record.clone() else {
            return Ok(false);
        };
        if record.address == address {
            return Ok(false);
        }
        if self.reregistered {
            tracing::info!(
                old = %record.address,
                new = %address,
                "Address changed again, automatic re-registration already used"
            );
            return Ok(false);
        }

        tracing::info!(old = %record.address, new = %address, "Host address changed");
        self.reregistered = true;
        record.address = address;
        self.record = Some(record.clone());
        self.publish(&record).map(|()| true)
    }

    /// Withdraw and release the registry
    pub fn shutdown(&mut self) {
        let _ = self.unregister();
        self.record = None;
        self.registry.shutdown();
    }
}

impl Drop for DiscoveryAdvertiser {
    fn drop(&mut self) {
        self.shutdown();
    }
}
