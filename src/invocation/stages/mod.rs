//! Chain stages and the standard chain layout.
//!
//! - [`status`] - Skip predicate and status gate
//! - [`topology`] - Topology capture and owner resolution
//! - [`locking`] - Per-key locks on the primary owner
//! - [`distribution`] - Forwarding, replication and broadcast
//! - [`entry`] - Load step and local commit
//! - [`transaction`] - Transactional load step and two-phase coordination

pub mod distribution;
pub mod entry;
pub mod locking;
pub mod status;
pub mod topology;
pub mod transaction;

pub use distribution::DistributionStage;
pub use entry::EntryStage;
pub use locking::LockingStage;
pub use status::StatusStage;
pub use topology::TopologyStage;
pub use transaction::{TxCoordinationStage, TxEntryStage};

use crate::commands::{Command, CommandResult, Key, LoadSource};
use crate::control::topology::NodeId;
use crate::core::error::{display_key, CacheError, CacheResult};
use crate::invocation::chain::{ChainSet, InterceptorChain, Stage};
use crate::invocation::components::NodeComponents;
use crate::invocation::context::InvocationContext;
use crate::net::transport::call_with_timeout;
use crate::storage::VersionedValue;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};

/// Build the chains of a node.
pub fn standard_chains(components: &Arc<NodeComponents>) -> ChainSet {
    let status: Arc<dyn Stage> = Arc::new(StatusStage::new(components.clone()));
    let topology: Arc<dyn Stage> = Arc::new(TopologyStage::new(components.clone()));
    let locking: Arc<dyn Stage> = Arc::new(LockingStage::new(components.clone()));
    let distribution: Arc<dyn Stage> = Arc::new(DistributionStage::new(components.clone()));
    let entry: Arc<dyn Stage> = Arc::new(EntryStage::new(components.clone()));
    let tx_entry: Arc<dyn Stage> = Arc::new(TxEntryStage::new(components.clone()));
    let coordination: Arc<dyn Stage> = Arc::new(TxCoordinationStage::new(components.clone()));

    ChainSet {
        read: InterceptorChain::builder()
            .stage(status.clone())
            .stage(topology.clone())
            .stage(distribution.clone())
            .stage(entry.clone())
            .build(),
        write: InterceptorChain::builder()
            .stage(status.clone())
            .stage(topology.clone())
            .stage(locking)
            .stage(distribution)
            .stage(entry.clone())
            .build(),
        transactional: InterceptorChain::builder()
            .stage(status.clone())
            .stage(topology.clone())
            .stage(tx_entry)
            .build(),
        tx_control: InterceptorChain::builder()
            .stage(status)
            .stage(topology)
            .stage(coordination)
            .stage(entry)
            .build(),
    }
}

/// Fetch the previous value of `key` from the source the resolver chose.
///
/// Remote loads are suspension points: the topology is re-checked as soon as
/// the reply arrives, and a failed load becomes `TopologyStale` when the
/// topology moved meanwhile.
pub(crate) async fn load_value(
    components: &NodeComponents,
    ctx: &mut InvocationContext,
    key: &Key,
    source: LoadSource,
) -> CacheResult<Option<VersionedValue>> {
    let targets = match source {
        LoadSource::Local => return Ok(components.container.load(key)),
        LoadSource::RemotePrimary => vec![ctx.primary_of(key)?],
        LoadSource::RemoteAll => ctx
            .owners(key)
            .map(|owners| owners.owners.clone())
            .unwrap_or_default(),
    };
    if targets.is_empty() {
        return Err(CacheError::internal(format!(
            "no owner to load key {} from",
            display_key(key)
        )));
    }

    tracing::debug!(
        key = %display_key(key),
        ?source,
        targets = targets.len(),
        topology = ctx.topology_id(),
        "loading previous value remotely"
    );

    let mut replies = JoinSet::new();
    for target in targets {
        let transport = components.transport.clone();
        let local = components.local.clone();
        let key = key.clone();
        let timeout = components.remote_timeout();
        let topology_id = ctx.topology_id();
        replies.spawn(async move {
            call_with_timeout(timeout, &target, transport.load(&local, &target, &key, topology_id))
                .await
        });
    }

    let outcome = ctx.suspend(first_reply(replies)).await;
    ctx.check_topology(&*components.oracle)?;
    outcome
}

async fn first_reply(
    mut replies: JoinSet<CacheResult<Option<VersionedValue>>>,
) -> CacheResult<Option<VersionedValue>> {
    let mut failure = None;
    while let Some(joined) = replies.join_next().await {
        match joined {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => failure = Some(err),
            Err(err) => failure = Some(CacheError::internal(err.to_string())),
        }
    }
    Err(failure.unwrap_or_else(|| CacheError::internal("remote load produced no reply")))
}

/// Send each command to its target concurrently.
pub(crate) fn send_all(
    components: &NodeComponents,
    messages: Vec<(NodeId, Command)>,
) -> Vec<JoinHandle<CacheResult<CommandResult>>> {
    messages
        .into_iter()
        .map(|(target, command)| {
            let transport = components.transport.clone();
            let local = components.local.clone();
            let timeout = components.remote_timeout();
            tokio::spawn(async move {
                call_with_timeout(timeout, &target, transport.invoke(&local, &target, command))
                    .await
            })
        })
        .collect()
}

/// Wait for every acknowledgment; the first failure wins.
pub(crate) async fn await_acks(
    handles: Vec<JoinHandle<CacheResult<CommandResult>>>,
) -> CacheResult<()> {
    let mut failure = None;
    for handle in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(err) => Err(CacheError::internal(err.to_string())),
        };
        if let Err(err) = outcome {
            failure.get_or_insert(err);
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Let acknowledgments arrive in the background, logging failures.
pub(crate) fn detach_acks(handles: Vec<JoinHandle<CacheResult<CommandResult>>>, what: &'static str) {
    if handles.is_empty() {
        return;
    }
    tokio::spawn(async move {
        if let Err(err) = await_acks(handles).await {
            tracing::warn!(error = %err, what, "asynchronous delivery failed");
        }
    });
}

/// Reclassify a remote failure as `TopologyStale` when the topology moved.
pub(crate) fn stale_or(
    components: &NodeComponents,
    ctx: &InvocationContext,
    err: CacheError,
) -> CacheError {
    if matches!(err, CacheError::Transport { .. }) {
        if let Err(stale) = ctx.check_topology(&*components.oracle) {
            return stale;
        }
    }
    err
}
