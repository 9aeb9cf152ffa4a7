//! Identification of the devices taking part in discovery and sessions

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Address of a device that has not been observed on the network yet
pub const INVALID_ADDRESS: &str = "invalid";

/// Port value of a device that has not been assigned a port yet
pub const UNASSIGNED_PORT: u16 = 0;

/// Name, address and ports of a network participant
///
/// Two identities are the same device when their address and name match,
/// ports may change between sessions without the device becoming "new"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Human readable name
    pub name: String,
    /// Observed ip address, `"invalid"` until a packet from the device was seen
    pub address: String,
    /// Port the device receives discovery datagrams on
    pub discovery_port: u16,
    /// Port the device accepts command connections on
    pub command_port: u16,
    /// Port the device receives sensor datagrams on
    pub data_port: u16,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Device `{0}` has no observed address")]
    NotObserved(String),
    #[error("Device `{0}` has a malformed address `{1}`")]
    Malformed(String, String),
}

impl DeviceIdentity {
    /// An identity for the local device, the address is filled in by whoever receives it
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_ports(name, UNASSIGNED_PORT, UNASSIGNED_PORT)
    }

    pub fn with_ports(name: impl Into<String>, command_port: u16, data_port: u16) -> Self {
        DeviceIdentity {
            name: name.into(),
            address: INVALID_ADDRESS.to_owned(),
            discovery_port: UNASSIGNED_PORT,
            command_port,
            data_port,
        }
    }

    /// Replaces the claimed address with the address a packet was actually received from
    pub fn observed_at(mut self, source: IpAddr) -> Self {
        self.address = source.to_string();
        self
    }

    pub fn ip(&self) -> Result<IpAddr, ResolveError> {
        if self.address == INVALID_ADDRESS {
            return Err(ResolveError::NotObserved(self.name.clone()));
        }

        self.address
            .parse()
            .map_err(|_| ResolveError::Malformed(self.name.clone(), self.address.clone()))
    }

    pub fn command_addr(&self) -> Result<SocketAddr, ResolveError> {
        Ok(SocketAddr::new(self.ip()?, self.command_port))
    }

    pub fn data_addr(&self) -> Result<SocketAddr, ResolveError> {
        Ok(SocketAddr::new(self.ip()?, self.data_port))
    }

    pub fn discovery_addr(&self) -> Result<SocketAddr, ResolveError> {
        Ok(SocketAddr::new(self.ip()?, self.discovery_port))
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.name == other.name
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.name.hash(state);
    }
}

impl Display for DeviceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}
