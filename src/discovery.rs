use crate::domain::events::{DiscoveredDevice, EngineEvent};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Service type advertised by JVC Connected Cam devices.
pub const SERVICE_TYPE: &str = "_jvc_procam_web._tcp.local.";

const DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Translate a resolved announcement into a device record. The model comes
/// from the TXT properties; the serial is embedded in the instance name
/// (`hc500-XXXXXXXX`).
fn device_from_info(info: &ServiceInfo) -> Option<DiscoveredDevice> {
    let instance = info.get_fullname().split('.').next()?.to_string();
    let model_name = info.get_property_val_str("model")?.to_string();
    let serial_number = instance.split('-').nth(1)?.to_string();
    let hostaddr = info.get_addresses().iter().next()?.to_string();
    Some(DiscoveredDevice {
        id: DiscoveredDevice::device_id(&model_name, &serial_number),
        model_name,
        serial_number,
        name: instance,
        hostaddr,
        hostport: info.get_port(),
    })
}

/// Browse the local network and feed `DeviceSeen` / `DeviceLost` into the
/// engine. Returns an error only when the browser cannot start at all; the
/// engine decides whether that is fatal (no seed config) or degraded mode.
#[instrument(skip_all)]
pub fn spawn(events: mpsc::Sender<EngineEvent>, cancel: CancellationToken) -> Result<JoinHandle<()>, DiscoveryError> {
    let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Browser { reason: e.to_string() })?;
    let receiver = daemon
        .browse(SERVICE_TYPE)
        .map_err(|e| DiscoveryError::Browser { reason: e.to_string() })?;
    info!("🔍 Discovery browsing for {}", SERVICE_TYPE);

    let handle = tokio::spawn(async move {
        // fullname → device id, so withdrawals can be correlated.
        let mut known: HashMap<String, String> = HashMap::new();
        let mut last_seen: HashMap<String, Instant> = HashMap::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = receiver.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            match event {
                ServiceEvent::ServiceResolved(service) => {
                    let Some(device) = device_from_info(&service) else {
                        warn!(fullname = service.get_fullname(), "⚠️ Could not parse announcement");
                        continue;
                    };
                    if let Some(at) = last_seen.get(&device.id) {
                        if at.elapsed() < DEDUP_WINDOW {
                            debug!(device_id = %device.id, "Duplicate announcement dropped");
                            continue;
                        }
                    }
                    last_seen.insert(device.id.clone(), Instant::now());
                    known.insert(service.get_fullname().to_string(), device.id.clone());
                    debug!(device_id = %device.id, host = %device.hostaddr, "🔍 Device seen");
                    if events.send(EngineEvent::DeviceSeen(device)).await.is_err() {
                        break;
                    }
                }
                ServiceEvent::ServiceRemoved(_, fullname) => {
                    let Some(id) = known.remove(&fullname) else { continue };
                    last_seen.remove(&id);
                    debug!(device_id = %id, "🔍 Device lost");
                    if events.send(EngineEvent::DeviceLost { id }).await.is_err() {
                        break;
                    }
                }
                _ => {}
            }
        }
        let _ = daemon.shutdown();
        debug!("Discovery task ended");
    });
    Ok(handle)
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("could not start the service browser: {reason}")]
    Browser { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn info(instance: &str, model: Option<&str>, ip: &str) -> ServiceInfo {
        let mut properties = HashMap::new();
        if let Some(model) = model {
            properties.insert("model".to_string(), model.to_string());
        }
        ServiceInfo::new(SERVICE_TYPE, instance, "cam.local.", ip, 80, properties).unwrap()
    }

    #[test]
    fn parses_model_serial_and_endpoint_from_an_announcement() {
        let device = device_from_info(&info("hc500-12345678", Some("GY-HC500"), "10.0.0.5")).unwrap();

        assert_eq!(device.id, "GY-HC500-12345678");
        assert_eq!(device.model_name, "GY-HC500");
        assert_eq!(device.serial_number, "12345678");
        assert_eq!(device.name, "hc500-12345678");
        assert_eq!(device.hostaddr, "10.0.0.5");
        assert_eq!(device.hostport, 80);
    }

    #[test]
    fn announcements_without_a_model_property_are_dropped() {
        assert_eq!(device_from_info(&info("hc500-12345678", None, "10.0.0.5")), None);
    }

    #[test]
    fn announcements_without_a_serial_suffix_are_dropped() {
        assert_eq!(device_from_info(&info("nameless", Some("GY-HC500"), "10.0.0.5")), None);
    }
}
