//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use tessera::cache::CacheNode;
use tessera::control::{NodeId, OwnershipOracle};
use tessera::core::config::{CacheMode, Config};
use tessera::core::runtime::Runtime;
use tessera::storage::ContainerStats;
use tessera::Key;

/// Start an in-process cluster of `members`, the first one being the
/// configured node.
pub fn start_cluster(mode: CacheMode, members: &[&str]) -> Runtime {
    start_cluster_with(mode, members, |_| {})
}

/// Start an in-process cluster after adjusting the configuration.
pub fn start_cluster_with(
    mode: CacheMode,
    members: &[&str],
    tweak: impl FnOnce(&mut Config),
) -> Runtime {
    let mut config = Config::for_node(members[0], members, mode);
    tweak(&mut config);
    let runtime = Runtime::new(config).expect("valid config");
    runtime.start();
    runtime
}

/// Enable optimistic transactions with write-skew checks.
pub fn with_transactions(config: &mut Config) {
    config.transaction.enabled = true;
}

pub fn node<'a>(runtime: &'a Runtime, id: &str) -> &'a CacheNode {
    runtime
        .node(id)
        .unwrap_or_else(|| panic!("no node {}", id))
}

/// Owners of `key` at the current topology.
pub fn owners_of(runtime: &Runtime, key: &[u8]) -> Vec<String> {
    let oracle = runtime.oracle();
    oracle
        .owners_of(key, oracle.current_topology_id())
        .expect("current topology")
        .iter()
        .map(|id| id.as_str().to_string())
        .collect()
}

/// A key whose owners start with `owners` (primary first).
pub fn key_owned_by(runtime: &Runtime, owners: &[&str]) -> Key {
    (0..10_000)
        .map(|i| Key::from(format!("key-{}", i)))
        .find(|key| {
            let actual = owners_of(runtime, key);
            actual.len() >= owners.len() && actual.iter().zip(owners).all(|(a, b)| a == b)
        })
        .unwrap_or_else(|| panic!("no key owned by {:?}", owners))
}

pub fn stats(runtime: &Runtime, id: &str) -> ContainerStats {
    node(runtime, id).container().stats()
}

/// Poll `condition` until it holds, giving up after about two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn node_id(id: &str) -> NodeId {
    NodeId::from(id)
}

/// Create a configuration file.
pub fn create_config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}
