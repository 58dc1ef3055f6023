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
//! Allocator behaviour across pools, reloads, warm starts and threads.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

use lb_address_pool::{
    AllocationError, AllocationRecord, Allocator, ConfigError, PoolConfig, PoolSpec, Port,
    SharedAllocator,
    allocator::AllocationErrorKind,
    pool::sharing::ConflictKind,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use test_log::test;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn allocator(specs: &[PoolSpec]) -> Allocator {
    let mut allocator = Allocator::new();
    allocator.reload(specs).expect("valid config");
    allocator
}

#[test]
fn pool_of_n_addresses_serves_exactly_n_services() {
    for (range, n) in [
        ("10.0.0.0/29", 8),
        ("10.0.0.5-10.0.0.9", 5),
        ("2001:db8::/125", 8),
        ("2001:db8::ffff-2001:db8::1:2", 4),
    ] {
        let mut allocator = allocator(&[PoolSpec::new("default", [range])]);

        let mut seen = BTreeSet::new();
        for i in 0..n {
            let address = allocator
                .allocate_default(&format!("svc-{i}"), &[], "")
                .expect("address available");
            assert!(seen.insert(address), "{address} handed out twice");
        }
        assert_eq!(
            allocator.allocate_default("one-too-many", &[], ""),
            Err(AllocationError::Exhausted {
                pool: "default".to_string()
            }),
            "{range}"
        );
        assert_eq!(allocator.pool_stats()[0].capacity, n);
        assert_eq!(allocator.pool_stats()[0].in_use as u128, n);
    }
}

#[test]
fn aggregated_pool_hands_out_blocks() {
    let mut allocator = allocator(&[PoolSpec::new("default", ["10.0.0.0/26"]).with_aggregation("/28")]);

    let addresses: Vec<IpAddr> = (0..4)
        .map(|i| allocator.allocate_default(&format!("svc-{i}"), &[], "").unwrap())
        .collect();
    assert_eq!(
        addresses,
        vec![
            ip("10.0.0.0"),
            ip("10.0.0.16"),
            ip("10.0.0.32"),
            ip("10.0.0.48")
        ]
    );
    assert!(allocator.allocate_default("svc-4", &[], "").is_err());

    // a specific address occupies its whole block
    allocator.release("svc-1");
    allocator
        .assign_specific("pinned", ip("10.0.0.20"), &[], "")
        .unwrap();
    assert_eq!(
        allocator
            .assign_specific("other", ip("10.0.0.17"), &[], "")
            .unwrap_err()
            .kind(),
        AllocationErrorKind::Conflict(ConflictKind::NotShareable)
    );
}

#[test]
fn services_on_one_address_never_share_a_port() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut allocator = allocator(&[PoolSpec::new("default", ["10.0.0.0/30"])]);
    let keys = ["", "blue", "green"];

    for i in 0..500 {
        let service = format!("svc-{}", rng.random_range(0..40));
        if rng.random_bool(0.2) {
            allocator.release(&service);
            continue;
        }
        let ports: Vec<Port> = (0..rng.random_range(1..3))
            .map(|_| Port::tcp(rng.random_range(80..84)))
            .collect();
        let key = keys[rng.random_range(0..keys.len())];
        let result = if rng.random_bool(0.5) {
            let address = IpAddr::from([10, 0, 0, rng.random_range(0..4)]);
            allocator
                .assign_specific(&service, address, &ports, key)
                .map(|_| ())
        } else {
            allocator
                .allocate_default(&service, &ports, key)
                .map(|_| ())
        };
        if let Err(e) = result {
            assert!(
                matches!(
                    e.kind(),
                    AllocationErrorKind::Conflict(_) | AllocationErrorKind::Exhausted
                ),
                "round {i}: {e}"
            );
        }

        let mut by_address: BTreeMap<IpAddr, Vec<AllocationRecord>> = BTreeMap::new();
        for record in allocator.allocations() {
            by_address.entry(record.address).or_default().push(record);
        }
        for (address, records) in by_address {
            if records.len() < 2 {
                continue;
            }
            let key = &records[0].sharing_key;
            assert!(key.is_shareable(), "round {i}: {address} shared without key");
            let mut ports = BTreeSet::new();
            for record in &records {
                assert_eq!(&record.sharing_key, key, "round {i}: {address}");
                for port in &record.ports {
                    assert!(ports.insert(*port), "round {i}: {address} reuses {port}");
                }
            }
        }
    }
}

#[test]
fn failed_reload_keeps_previous_pools() {
    let mut allocator = allocator(&[PoolSpec::new("default", ["10.0.0.0/30"])]);
    allocator.allocate_default("svc", &[], "").unwrap();

    let config: PoolConfig = serde_json::from_str(
        r#"{"pools": [
            {"name": "default", "ranges": ["10.0.0.0/29"]},
            {"name": "v6", "ranges": ["2001:db8::/64"], "aggregation": "/120"},
            {"name": "clash", "ranges": ["10.0.0.6-10.0.0.9"]}
        ]}"#,
    )
    .unwrap();
    assert_eq!(
        allocator.reload(&config.pools),
        Err(ConfigError::PoolOverlap {
            pool: "clash".to_string(),
            existing: "default".to_string()
        })
    );
    assert_eq!(allocator.pool_names(), vec!["default"]);
    assert_eq!(allocator.pool_stats()[0].capacity, 4);
    assert_eq!(allocator.address_of("svc"), Some(ip("10.0.0.0")));

    allocator.reload(&config.pools[..2]).unwrap();
    assert_eq!(allocator.pool_names(), vec!["default", "v6"]);
    assert_eq!(allocator.pool_stats()[0].capacity, 8);
    assert_eq!(allocator.pool_stats()[0].in_use, 1);
    assert_eq!(allocator.pool_stats()[1].capacity, 1 << 56);
}

#[test]
fn warm_start_rebuilds_the_same_state() {
    let specs = [
        PoolSpec::new("default", ["10.0.0.0/28"]),
        PoolSpec::new("v6", ["2001:db8::/120"]),
    ];
    let mut first_run = allocator(&specs);
    first_run
        .allocate_default("a", &[Port::tcp(80)], "web")
        .unwrap();
    first_run
        .assign_specific("b", ip("10.0.0.0"), &[Port::tcp(443)], "web")
        .unwrap();
    first_run
        .allocate_from_pool("c", "v6", &[Port::udp(53)], "")
        .unwrap();
    first_run.allocate_default("d", &[], "").unwrap();
    first_run.release("a");

    let snapshot = serde_json::to_string(&first_run.allocations()).unwrap();
    let records: Vec<AllocationRecord> = serde_json::from_str(&snapshot).unwrap();

    let mut restarted = allocator(&specs);
    let report = restarted.replay(records);
    assert_eq!(report.restored, 3);
    assert!(report.failed.is_empty());
    assert_eq!(restarted.allocations(), first_run.allocations());
    assert_eq!(restarted.pool_stats(), first_run.pool_stats());

    // both allocators continue identically
    assert_eq!(
        restarted.allocate_default("e", &[], ""),
        first_run.allocate_default("e", &[], "")
    );
}

#[test]
fn concurrent_allocations_are_unique() {
    let shared = SharedAllocator::new(allocator(&[PoolSpec::new("default", ["10.0.0.0/24"])]));

    std::thread::scope(|s| {
        for t in 0..8 {
            let shared = shared.clone();
            s.spawn(move || {
                for i in 0..40 {
                    let service = format!("t{t}-svc{i}");
                    shared
                        .allocate_default(&service, &[], "")
                        .expect("pool has room");
                    if i % 3 == 0 {
                        shared.release(&service);
                    }
                }
            });
        }
    });

    let allocations = shared.allocations();
    let addresses: BTreeSet<IpAddr> = allocations.iter().map(|record| record.address).collect();
    assert_eq!(addresses.len(), allocations.len());
    // every thread keeps 26 of its 40 services
    assert_eq!(allocations.len(), 208);
    assert_eq!(shared.pool_stats()[0].in_use, 208);
}
