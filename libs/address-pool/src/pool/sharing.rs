// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Ports, sharing keys and the rule deciding when two services may share one
//! address.

use std::{fmt, net::IpAddr, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Transport protocol of a service port.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// SCTP
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

/// A `(protocol, port)` tuple a service exposes on its address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
pub struct Port {
    /// The transport protocol.
    pub protocol: Protocol,
    /// The port number.
    pub port: u16,
}

impl Port {
    /// A TCP port.
    pub const fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            port,
        }
    }

    /// A UDP port.
    pub const fn udp(port: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            port,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.port)
    }
}

/// Port parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParsePortError {
    /// Not of the form `protocol/port`.
    #[error("expected <protocol>/<port>, got {0:?}")]
    InvalidFormat(String),
    /// Unknown protocol name.
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),
    /// Port number is not a valid u16.
    #[error("invalid port number {0:?}")]
    InvalidPort(String),
}

impl FromStr for Port {
    type Err = ParsePortError;

    /// Parses `tcp/80`, `udp/53` or `sctp/3868`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, port) = s
            .split_once('/')
            .ok_or_else(|| ParsePortError::InvalidFormat(s.to_string()))?;
        let protocol = match protocol.trim().to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            "sctp" => Protocol::Sctp,
            other => return Err(ParsePortError::UnknownProtocol(other.to_string())),
        };
        let port = port
            .trim()
            .parse()
            .map_err(|_| ParsePortError::InvalidPort(port.to_string()))?;
        Ok(Self { protocol, port })
    }
}

/// A sharing key. Services presenting the same non-empty key may share an
/// address as long as their ports do not collide. The empty key never shares.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct SharingKey(String);

impl SharingKey {
    /// The key that does not permit sharing.
    pub const fn none() -> Self {
        Self(String::new())
    }

    /// Returns true if the key permits sharing.
    pub fn is_shareable(&self) -> bool {
        !self.0.is_empty()
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SharingKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for SharingKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<Option<String>> for SharingKey {
    fn from(key: Option<String>) -> Self {
        Self(key.unwrap_or_default())
    }
}

impl fmt::Display for SharingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Coarse classification of a [ConflictError].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// One side did not supply a sharing key.
    NotShareable,
    /// Both sides supplied different sharing keys.
    KeyMismatch,
    /// The sharing keys match but a port is used twice.
    PortCollision,
}

/// Reasons why a service cannot take an address that is already in use.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConflictError {
    /// The current holder does not allow sharing.
    #[error("service {service:?} holds {address} and does not allow sharing")]
    ExistingNotShareable {
        /// The contested address.
        address: IpAddr,
        /// The service holding the address.
        service: String,
    },
    /// The requester does not allow sharing.
    #[error("{address} is in use and the new service does not allow sharing")]
    NewNotShareable {
        /// The contested address.
        address: IpAddr,
    },
    /// The sharing keys differ.
    #[error("sharing key {requested} does not match existing sharing key {existing} on {address}")]
    KeyMismatch {
        /// The contested address.
        address: IpAddr,
        /// The key supplied by the requester.
        requested: SharingKey,
        /// The key of the current holder.
        existing: SharingKey,
    },
    /// A requested port is already exposed on the address.
    #[error("port {port} on {address} is already used by service {service:?}")]
    PortCollision {
        /// The contested address.
        address: IpAddr,
        /// The colliding port.
        port: Port,
        /// The service exposing the port.
        service: String,
    },
}

impl ConflictError {
    /// Returns the kind of conflict.
    pub fn kind(&self) -> ConflictKind {
        match self {
            ConflictError::ExistingNotShareable { .. } | ConflictError::NewNotShareable { .. } => {
                ConflictKind::NotShareable
            }
            ConflictError::KeyMismatch { .. } => ConflictKind::KeyMismatch,
            ConflictError::PortCollision { .. } => ConflictKind::PortCollision,
        }
    }
}

/// Checks whether a holder's key admits a requester's key on `address`.
pub(crate) fn check_keys(
    address: IpAddr,
    holder: &str,
    existing: &SharingKey,
    requested: &SharingKey,
) -> Result<(), ConflictError> {
    if !existing.is_shareable() {
        return Err(ConflictError::ExistingNotShareable {
            address,
            service: holder.to_string(),
        });
    }
    if !requested.is_shareable() {
        return Err(ConflictError::NewNotShareable { address });
    }
    if existing != requested {
        return Err(ConflictError::KeyMismatch {
            address,
            requested: requested.clone(),
            existing: existing.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn parses_ports() {
        assert_eq!("tcp/80".parse(), Ok(Port::tcp(80)));
        assert_eq!("UDP/53".parse(), Ok(Port::udp(53)));
        assert_eq!(
            "sctp/3868".parse(),
            Ok(Port {
                protocol: Protocol::Sctp,
                port: 3868
            })
        );
        assert_eq!(
            "80".parse::<Port>(),
            Err(ParsePortError::InvalidFormat("80".into()))
        );
        assert_eq!(
            "icmp/1".parse::<Port>(),
            Err(ParsePortError::UnknownProtocol("icmp".into()))
        );
        assert_eq!(
            "tcp/70000".parse::<Port>(),
            Err(ParsePortError::InvalidPort("70000".into()))
        );
        assert_eq!(Port::udp(53).to_string(), "udp/53");
    }

    #[test]
    fn empty_keys_never_share() {
        let err = check_keys(addr(), "a", &SharingKey::none(), &"k".into()).unwrap_err();
        assert_eq!(err.kind(), ConflictKind::NotShareable);
        assert!(matches!(err, ConflictError::ExistingNotShareable { .. }));

        let err = check_keys(addr(), "a", &"k".into(), &SharingKey::none()).unwrap_err();
        assert_eq!(err, ConflictError::NewNotShareable { address: addr() });
    }

    #[test]
    fn keys_must_match() {
        let err = check_keys(addr(), "a", &"blue".into(), &"green".into()).unwrap_err();
        assert_eq!(err.kind(), ConflictKind::KeyMismatch);
        assert_eq!(
            err.to_string(),
            "sharing key \"green\" does not match existing sharing key \"blue\" on 10.0.0.1"
        );

        check_keys(addr(), "a", &"blue".into(), &"blue".into()).expect("keys match");
    }

    #[test]
    fn ports_serialize_as_objects() {
        let json = serde_json::to_string(&Port::tcp(443)).unwrap();
        assert_eq!(json, r#"{"protocol":"tcp","port":443}"#);
        let key: SharingKey = serde_json::from_str(r#""shared""#).unwrap();
        assert_eq!(key.as_str(), "shared");
    }
}
