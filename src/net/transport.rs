//! Transport contracts.
//!
//! The pipeline needs exactly two remote operations: run a command on
//! another node, and read a key's stored value from another node. Both are
//! asynchronous suspension points; callers bound them with the configured
//! remote timeout through [`call_with_timeout`].

use crate::commands::{Command, CommandResult};
use crate::control::topology::{NodeId, TopologyId};
use crate::core::error::{CacheError, CacheResult};
use crate::storage::VersionedValue;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by transports and inbound handlers.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = CacheResult<T>> + Send + 'a>>;

/// Outbound side: how a node reaches its peers.
pub trait Transport: Send + Sync {
    /// Run `command` on `target` and return its result.
    fn invoke<'a>(
        &'a self,
        from: &'a NodeId,
        target: &'a NodeId,
        command: Command,
    ) -> TransportFuture<'a, CommandResult>;

    /// Read the stored value of `key` on `target`.
    fn load<'a>(
        &'a self,
        from: &'a NodeId,
        target: &'a NodeId,
        key: &'a [u8],
        topology_id: TopologyId,
    ) -> TransportFuture<'a, Option<VersionedValue>>;
}

/// Inbound side: how a node serves its peers.
pub trait InboundHandler: Send + Sync {
    /// Run a command sent by `from` through the local chains.
    fn handle_command<'a>(&'a self, from: NodeId, command: Command)
        -> TransportFuture<'a, CommandResult>;

    /// Serve a remote load of `key`.
    fn handle_load(&self, key: &[u8], topology_id: TopologyId)
        -> CacheResult<Option<VersionedValue>>;
}

/// Bound a remote call, turning an elapsed timeout into a transport failure.
pub async fn call_with_timeout<T, F>(timeout: Duration, target: &NodeId, fut: F) -> CacheResult<T>
where
    F: Future<Output = CacheResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::transport(
            target.as_str(),
            format!("no reply within {}ms", timeout.as_millis()),
        )),
    }
}
