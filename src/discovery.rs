use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::error::TransportError;

/// Hosts exposing a parameter set advertise on this service.
pub const HOST_SERVICE_TYPE: &str = "_ardesign-p._udp.local.";
/// Reserved for a future spectator role. Part of the protocol surface,
/// unused by the core logic.
pub const SPECTATOR_SERVICE_TYPE: &str = "_ardesign-s._udp.local.";

/// TXT record keys on the advertised service.
pub const ATTR_ID: &str = "id";
pub const ATTR_NAME: &str = "name";

/// mDNS advertise/browse for the host service. Hosts register themselves;
/// controllers browse.
pub struct Discovery {
    daemon: ServiceDaemon,
    registered_service: Option<String>, // fullname of the registered service
}

impl Discovery {
    pub fn new() -> Result<Self, TransportError> {
        let daemon = ServiceDaemon::new()?;
        Ok(Self {
            daemon,
            registered_service: None,
        })
    }

    /// Advertises this device as a host. Re-registering replaces the
    /// previous advertisement.
    pub fn register(
        &mut self,
        device_id: &str,
        advertised_name: &str,
        port: u16,
    ) -> Result<(), TransportError> {
        if let Some(fullname) = &self.registered_service {
            tracing::info!("unregistering old service: {}", fullname);
            let _ = self.daemon.unregister(fullname);
        }

        let ip = local_ip().map_err(|e| TransportError::Setup(e.to_string()))?;
        let m_hostname = format!("{}.local.", device_id);

        let properties = [
            ("version", "0.1.0"),
            (ATTR_ID, device_id),
            (ATTR_NAME, advertised_name),
        ];

        let service_info = ServiceInfo::new(
            HOST_SERVICE_TYPE,
            device_id,
            &m_hostname,
            &ip.to_string(),
            port,
            &properties[..],
        )?;

        let fullname = service_info.get_fullname().to_string();

        self.daemon.register(service_info)?;
        tracing::info!(
            "advertising host {} ({}) on {}:{}",
            device_id,
            fullname,
            ip,
            port
        );

        self.registered_service = Some(fullname);

        Ok(())
    }

    pub fn browse(&self) -> Result<mdns_sd::Receiver<ServiceEvent>, TransportError> {
        let receiver = self.daemon.browse(HOST_SERVICE_TYPE)?;
        Ok(receiver)
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(fullname) = &self.registered_service {
            tracing::info!("unregistering service: {}", fullname);
            if let Err(e) = self.daemon.unregister(fullname) {
                tracing::error!("failed to unregister service: {}", e);
            }
            // Give the daemon time to send the goodbye packet before we drop
            // it (and likely kill its background thread)
            std::thread::sleep(std::time::Duration::from_millis(300));
        }
    }
}
