//! Multicast DNS registry

use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;
use std::time::Duration;

use super::{ServiceRecord, ServiceRegistry};
use crate::error::DiscoveryError;

const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(1);

pub struct MdnsRegistry {
    daemon: Option<ServiceDaemon>,
    host_name: String,
}

impl MdnsRegistry {
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonUnavailable(e.to_string()))?;
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "ar-streamer".to_string());
        Ok(Self {
            daemon: Some(daemon),
            host_name: format!("{}.local.", host.trim_end_matches(".local")),
        })
    }

    fn daemon(&self) -> Result<&ServiceDaemon, DiscoveryError> {
        self.daemon
            .as_ref()
            .ok_or_else(|| DiscoveryError::DaemonUnavailable("daemon shut down".into()))
    }
}

impl ServiceRegistry for MdnsRegistry {
    fn register(&mut self, record: &ServiceRecord) -> Result<String, DiscoveryError> {
        let properties: HashMap<String, String> = record.attributes.iter().cloned().collect();
        let info = ServiceInfo::new(
            &record.service_type,
            &record.instance_name,
            &self.host_name,
            record.address,
            record.port,
            properties,
        )
        .map_err(|e| DiscoveryError::RegistrationFailed(e.to_string()))?;

        let fullname = info.get_fullname().to_string();
        self.daemon()?
            .register(info)
            .map_err(|e| DiscoveryError::RegistrationFailed(e.to_string()))?;
        Ok(fullname)
    }

    fn unregister(&mut self, fullname: &str) -> Result<(), DiscoveryError> {
        let status = self
            .daemon()?
            .unregister(fullname)
            .map_err(|e| DiscoveryError::UnregistrationFailed(e.to_string()))?;
        // Wait briefly so the goodbye packet leaves before a re-registration
        if status.recv_timeout(UNREGISTER_TIMEOUT).is_err() {
            tracing::debug!("No unregistration confirmation for {}", fullname);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            if let Err(e) = daemon.shutdown() {
                tracing::debug!("mDNS daemon shutdown failed: {}", e);
            }
        }
    }
}
