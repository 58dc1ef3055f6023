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
//! Serializable form of allocations.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    allocator::Allocation,
    pool::sharing::{Port, SharingKey},
};

/// A service's allocation as persisted by the owner of the service records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AllocationRecord {
    /// The service id.
    pub service: String,
    /// The pool the address was allocated from. Informational on replay, the
    /// owning pool is looked up by address.
    #[serde(default)]
    pub pool: String,
    /// The allocated address.
    #[schema(value_type = String)]
    pub address: IpAddr,
    /// The ports the service exposes.
    #[serde(default)]
    pub ports: Vec<Port>,
    /// The service's sharing key. Empty if the service does not share.
    #[serde(default)]
    pub sharing_key: SharingKey,
}

impl AllocationRecord {
    pub(crate) fn new(service: &str, alloc: &Allocation) -> Self {
        Self {
            service: service.to_string(),
            pool: alloc.pool.clone(),
            address: alloc.address,
            ports: alloc.ports.iter().copied().collect(),
            sharing_key: alloc.sharing_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_default() {
        let record: AllocationRecord =
            serde_json::from_str(r#"{"service": "ns/web", "address": "192.168.1.7"}"#)
                .expect("valid record");
        assert_eq!(record.service, "ns/web");
        assert_eq!(record.pool, "");
        assert!(record.ports.is_empty());
        assert!(!record.sharing_key.is_shareable());
    }

    #[test]
    fn serializes_like_it_deserializes() {
        let record = AllocationRecord {
            service: "ns/dns".to_string(),
            pool: "default".to_string(),
            address: "2001:db8::1".parse().unwrap(),
            ports: vec![Port::udp(53), Port::tcp(53)],
            sharing_key: SharingKey::from("dns"),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "service": "ns/dns",
                "pool": "default",
                "address": "2001:db8::1",
                "ports": [
                    {"protocol": "udp", "port": 53},
                    {"protocol": "tcp", "port": 53},
                ],
                "sharing_key": "dns",
            })
        );
    }
}
