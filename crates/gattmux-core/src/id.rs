//! Identifiers for devices, operation targets and GATT attributes

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{GattmuxError, Result};

/// Stable identifier for a remote peripheral.
///
/// Always stored as an upper-case, colon-separated MAC address
/// (`AA:BB:CC:DD:EE:FF`), so the same radio compares equal no matter how the
/// address was spelled when it was handed to us.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Parse and normalize an address.
    ///
    /// Accepts `:` or `-` separators, or none at all, in either case.
    pub fn parse(address: &str) -> Result<Self> {
        let hex: String = address
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();

        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(GattmuxError::InvalidAddress(address.to_string()));
        }

        let upper = hex.to_ascii_uppercase();
        let normalized = upper
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(":");

        Ok(Self(normalized))
    }

    /// Get the normalized address
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = GattmuxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = GattmuxError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// What an operation acts on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// The local adapter itself
    Adapter,
    /// A remote peripheral
    Device(DeviceId),
}

impl Target {
    /// The device this target names, if any
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Target::Adapter => None,
            Target::Device(id) => Some(id),
        }
    }
}

impl From<DeviceId> for Target {
    fn from(id: DeviceId) -> Self {
        Target::Device(id)
    }
}

impl From<&DeviceId> for Target {
    fn from(id: &DeviceId) -> Self {
        Target::Device(id.clone())
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Adapter => write!(f, "adapter"),
            Target::Device(id) => write!(f, "{}", id),
        }
    }
}

/// A characteristic, or a descriptor under it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeId {
    /// Owning service
    pub service: Uuid,
    /// Characteristic within the service
    pub characteristic: Uuid,
    /// Descriptor within the characteristic, for descriptor operations
    pub descriptor: Option<Uuid>,
}

impl AttributeId {
    /// Identify a characteristic
    pub fn characteristic(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
            descriptor: None,
        }
    }

    /// Identify a descriptor
    pub fn descriptor(service: Uuid, characteristic: Uuid, descriptor: Uuid) -> Self {
        Self {
            service,
            characteristic,
            descriptor: Some(descriptor),
        }
    }
}

impl std::fmt::Display for AttributeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.descriptor {
            Some(desc) => write!(f, "{}/{}/{}", self.service, self.characteristic, desc),
            None => write!(f, "{}/{}", self.service, self.characteristic),
        }
    }
}
