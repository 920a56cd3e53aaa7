use crate::session::ConnectionState;

/// A camera announced on the network, translated from its mDNS service info.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveredDevice {
    /// Stable id derived from model and serial, e.g. `GY-HC500-12345678`.
    pub id: String,
    pub model_name: String,
    pub serial_number: String,
    /// Service instance name as advertised, e.g. `hc500-12345678`.
    pub name: String,
    pub hostaddr: String,
    pub hostport: u16,
}

impl DiscoveredDevice {
    pub fn device_id(model_name: &str, serial_number: &str) -> String {
        format!("{}-{}", model_name, serial_number)
    }
}

/// Inbox of the engine supervisor. Everything that changes the set of known
/// devices or their sessions flows through here so the engine observes a
/// single ordered stream.
#[derive(Debug)]
pub enum EngineEvent {
    DeviceSeen(DiscoveredDevice),
    DeviceLost { id: String },
    ConnectRequest { id: String },
    DisconnectRequest { id: String },
    ReconnectRequest { id: String },
    SessionState { id: String, state: ConnectionState },
}
