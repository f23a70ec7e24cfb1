//! Commands.
//!
//! Every read or mutation that must behave consistently across the cluster
//! is a [`Command`]: a tagged [`CommandKind`] plus flags, the topology id it
//! was created (or forwarded) under, and the [`LoadType`] declared when it
//! was built.
//!
//! # Command Classification
//!
//! | Category | Commands | LoadType |
//! |----------|----------|----------|
//! | Reads | GET | Owner |
//! | Local admin | SIZE | unsupported |
//! | Plain writes | PUT, REMOVE | Primary (DontLoad when return values are ignored) |
//! | Conditional writes | PUT_IF_ABSENT, REPLACE, REPLACE_IF_EQUALS, REMOVE_IF_EQUALS | Primary |
//! | Delta writes | INCREMENT, APPEND | Owner |
//! | Broadcast writes | INVALIDATE, CLEAR, APPLY_VALUE | DontLoad |
//! | Transaction control | PREPARE, COMMIT, ROLLBACK | DontLoad |
//!
//! Stages never call [`Command::perform`]; they specialise behaviour through
//! [`dispatch::DispatchTable`] via [`Command::accept`].

pub mod dispatch;
pub mod load_type;
mod perform;

pub use dispatch::DispatchTable;
pub use load_type::{resolve, LoadDecision, LoadQuery, LoadSource, LoadType};

use crate::control::topology::{NodeId, TopologyId};
use crate::core::error::{CacheError, CacheResult};
use crate::core::lifecycle::ComponentStatus;
use crate::invocation::context::InvocationContext;
use bytes::Bytes;
use std::collections::BTreeSet;

/// Cache key.
pub type Key = Bytes;

/// Cache value.
pub type Value = Bytes;

/// Behavioural modifiers carried by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Flag {
    /// Do not acquire key locks.
    SkipLocking,
    /// Wait for replication acknowledgments even in asynchronous modes.
    ForceSynchronous,
    /// The caller does not need the previous value.
    IgnoreReturnValues,
    /// Apply on this node only; never replicate or forward.
    CacheModeLocal,
}

/// A set of [`Flag`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags(BTreeSet<Flag>);

impl Flags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn of(flags: &[Flag]) -> Self {
        Self(flags.iter().copied().collect())
    }

    pub fn with(mut self, flag: Flag) -> Self {
        self.0.insert(flag);
        self
    }

    pub fn contains(&self, flag: Flag) -> bool {
        self.0.contains(&flag)
    }

    pub fn iter(&self) -> impl Iterator<Item = Flag> + '_ {
        self.0.iter().copied()
    }
}

/// Transaction identifier: originating node plus a local sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxId {
    pub origin: NodeId,
    pub seq: u64,
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

/// Version a transaction observed when it read a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedVersion {
    /// The key did not exist.
    Absent,
    /// The key existed at this version.
    At(u64),
}

/// One key's modification inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TxWrite {
    /// The command the transaction executed for this key (last one wins).
    pub command: Command,
    /// What the originator saw when it loaded the key, if it loaded it.
    pub observed: Option<ObservedVersion>,
    /// Value computed at the originator; `None` removes the key.
    pub final_value: Option<Value>,
}

impl TxWrite {
    pub fn key(&self) -> Option<&Key> {
        self.command.key()
    }
}

/// The kind of a command and its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Get { key: Key },
    Size,
    Put { key: Key, value: Value },
    PutIfAbsent { key: Key, value: Value },
    Replace { key: Key, value: Value },
    ReplaceIfEquals { key: Key, expected: Value, value: Value },
    Remove { key: Key },
    RemoveIfEquals { key: Key, expected: Value },
    Increment { key: Key, delta: i64 },
    Append { key: Key, suffix: Value },
    /// Store a value computed elsewhere; `None` removes the key.
    ApplyValue { key: Key, value: Option<Value> },
    Invalidate { keys: Vec<Key> },
    Clear,
    Prepare { tx_id: TxId, writes: Vec<TxWrite> },
    Commit { tx_id: TxId, writes: Vec<TxWrite> },
    Rollback { tx_id: TxId },
}

/// Payload-free tag of a [`CommandKind`], used as a dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandTag {
    Get,
    Size,
    Put,
    PutIfAbsent,
    Replace,
    ReplaceIfEquals,
    Remove,
    RemoveIfEquals,
    Increment,
    Append,
    ApplyValue,
    Invalidate,
    Clear,
    Prepare,
    Commit,
    Rollback,
}

impl CommandTag {
    /// Every tag, in declaration order.
    pub const ALL: [CommandTag; 16] = [
        Self::Get,
        Self::Size,
        Self::Put,
        Self::PutIfAbsent,
        Self::Replace,
        Self::ReplaceIfEquals,
        Self::Remove,
        Self::RemoveIfEquals,
        Self::Increment,
        Self::Append,
        Self::ApplyValue,
        Self::Invalidate,
        Self::Clear,
        Self::Prepare,
        Self::Commit,
        Self::Rollback,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Size => "size",
            Self::Put => "put",
            Self::PutIfAbsent => "put-if-absent",
            Self::Replace => "replace",
            Self::ReplaceIfEquals => "replace-if-equals",
            Self::Remove => "remove",
            Self::RemoveIfEquals => "remove-if-equals",
            Self::Increment => "increment",
            Self::Append => "append",
            Self::ApplyValue => "apply-value",
            Self::Invalidate => "invalidate",
            Self::Clear => "clear",
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }

    pub fn category(&self) -> CommandCategory {
        match self {
            Self::Get | Self::Size => CommandCategory::Read,
            Self::Prepare | Self::Commit | Self::Rollback => CommandCategory::TxControl,
            _ => CommandCategory::Write,
        }
    }
}

impl std::fmt::Display for CommandTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CommandTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|tag| tag.name() == s)
            .ok_or_else(|| format!("unknown command kind: {}", s))
    }
}

/// Chain category a command is routed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCategory {
    Read,
    Write,
    TxControl,
}

/// Result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// A value: the read value, or the previous value of a write.
    Value(Option<Value>),
    /// Outcome of a conditional write.
    Conditional {
        success: bool,
        previous: Option<Value>,
    },
    /// New counter value.
    Counter(i64),
    /// Number of entries.
    Size(usize),
    /// Acknowledgment with no payload.
    Done,
    /// The command was skipped by its status predicate.
    Skipped,
}

impl CommandResult {
    /// Previous or read value, when the result carries one.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => value.as_ref(),
            Self::Conditional { previous, .. } => previous.as_ref(),
            _ => None,
        }
    }

    /// Whether a conditional write applied; unconditional results count as applied.
    pub fn is_successful(&self) -> bool {
        match self {
            Self::Conditional { success, .. } => *success,
            Self::Skipped => false,
            _ => true,
        }
    }
}

/// A unit of work submitted to the interceptor chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    kind: CommandKind,
    flags: Flags,
    topology_id: TopologyId,
    load_type: Option<LoadType>,
    pinned_version: Option<u64>,
}

impl Command {
    /// Build a command; its load type is fixed here.
    pub fn new(kind: CommandKind) -> Self {
        Self::with_flags(kind, Flags::none())
    }

    /// Build a command with flags; its load type is fixed here.
    pub fn with_flags(kind: CommandKind, flags: Flags) -> Self {
        let load_type = declared_load_type(&kind, &flags);
        Self {
            kind,
            flags,
            topology_id: 0,
            load_type,
            pinned_version: None,
        }
    }

    pub fn get(key: impl Into<Key>) -> Self {
        Self::new(CommandKind::Get { key: key.into() })
    }

    pub fn size() -> Self {
        Self::new(CommandKind::Size)
    }

    pub fn put(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self::new(CommandKind::Put {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn put_if_absent(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self::new(CommandKind::PutIfAbsent {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn replace(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self::new(CommandKind::Replace {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn replace_if_equals(
        key: impl Into<Key>,
        expected: impl Into<Value>,
        value: impl Into<Value>,
    ) -> Self {
        Self::new(CommandKind::ReplaceIfEquals {
            key: key.into(),
            expected: expected.into(),
            value: value.into(),
        })
    }

    pub fn remove(key: impl Into<Key>) -> Self {
        Self::new(CommandKind::Remove { key: key.into() })
    }

    pub fn remove_if_equals(key: impl Into<Key>, expected: impl Into<Value>) -> Self {
        Self::new(CommandKind::RemoveIfEquals {
            key: key.into(),
            expected: expected.into(),
        })
    }

    pub fn increment(key: impl Into<Key>, delta: i64) -> Self {
        Self::new(CommandKind::Increment {
            key: key.into(),
            delta,
        })
    }

    pub fn append(key: impl Into<Key>, suffix: impl Into<Value>) -> Self {
        Self::new(CommandKind::Append {
            key: key.into(),
            suffix: suffix.into(),
        })
    }

    pub fn invalidate(keys: Vec<Key>) -> Self {
        Self::new(CommandKind::Invalidate { keys })
    }

    pub fn clear() -> Self {
        Self::new(CommandKind::Clear)
    }

    /// Add a flag before submission; the load type is re-derived.
    pub fn flag(self, flag: Flag) -> Self {
        let flags = self.flags.with(flag);
        let mut command = Self::with_flags(self.kind, flags);
        command.topology_id = self.topology_id;
        command.pinned_version = self.pinned_version;
        command
    }

    /// Copy stamped with the topology id it is sent under.
    pub fn stamped(&self, topology_id: TopologyId) -> Self {
        let mut command = self.clone();
        command.topology_id = topology_id;
        command
    }

    /// Copy sent to a backup owner, carrying the version the primary committed.
    pub fn for_backup(&self, topology_id: TopologyId, version: Option<u64>) -> Self {
        let mut command = self.stamped(topology_id);
        command.pinned_version = version;
        command
    }

    /// Final-value copy of a write for an owner that must not recompute it.
    pub fn apply_value(
        key: Key,
        value: Option<Value>,
        topology_id: TopologyId,
        version: Option<u64>,
    ) -> Self {
        let mut command = Self::new(CommandKind::ApplyValue { key, value });
        command.topology_id = topology_id;
        command.pinned_version = version;
        command
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(flag)
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Version the committing node must assign, when dictated by the primary.
    pub fn pinned_version(&self) -> Option<u64> {
        self.pinned_version
    }

    pub fn tag(&self) -> CommandTag {
        match &self.kind {
            CommandKind::Get { .. } => CommandTag::Get,
            CommandKind::Size => CommandTag::Size,
            CommandKind::Put { .. } => CommandTag::Put,
            CommandKind::PutIfAbsent { .. } => CommandTag::PutIfAbsent,
            CommandKind::Replace { .. } => CommandTag::Replace,
            CommandKind::ReplaceIfEquals { .. } => CommandTag::ReplaceIfEquals,
            CommandKind::Remove { .. } => CommandTag::Remove,
            CommandKind::RemoveIfEquals { .. } => CommandTag::RemoveIfEquals,
            CommandKind::Increment { .. } => CommandTag::Increment,
            CommandKind::Append { .. } => CommandTag::Append,
            CommandKind::ApplyValue { .. } => CommandTag::ApplyValue,
            CommandKind::Invalidate { .. } => CommandTag::Invalidate,
            CommandKind::Clear => CommandTag::Clear,
            CommandKind::Prepare { .. } => CommandTag::Prepare,
            CommandKind::Commit { .. } => CommandTag::Commit,
            CommandKind::Rollback { .. } => CommandTag::Rollback,
        }
    }

    pub fn category(&self) -> CommandCategory {
        self.tag().category()
    }

    pub fn is_write(&self) -> bool {
        self.category() == CommandCategory::Write
    }

    /// The single key of a single-key command.
    pub fn key(&self) -> Option<&Key> {
        match &self.kind {
            CommandKind::Get { key }
            | CommandKind::Put { key, .. }
            | CommandKind::PutIfAbsent { key, .. }
            | CommandKind::Replace { key, .. }
            | CommandKind::ReplaceIfEquals { key, .. }
            | CommandKind::Remove { key }
            | CommandKind::RemoveIfEquals { key, .. }
            | CommandKind::Increment { key, .. }
            | CommandKind::Append { key, .. }
            | CommandKind::ApplyValue { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Every key the command touches.
    pub fn keys(&self) -> Vec<Key> {
        match &self.kind {
            CommandKind::Invalidate { keys } => keys.clone(),
            CommandKind::Prepare { writes, .. } | CommandKind::Commit { writes, .. } => {
                writes.iter().filter_map(|w| w.key().cloned()).collect()
            }
            _ => self.key().cloned().into_iter().collect(),
        }
    }

    /// Nodes on which the previous value of the command's keys must be read.
    ///
    /// Fails with `Unsupported` only for local administrative commands.
    pub fn load_type(&self) -> CacheResult<LoadType> {
        self.load_type
            .ok_or_else(|| CacheError::unsupported(format!("load_type for {}", self.tag())))
    }

    /// Whether the command must be discarded given the cache status.
    pub fn should_skip(&self, status: ComponentStatus) -> bool {
        match self.kind {
            CommandKind::Invalidate { .. } => status.is_stopping_or_stopped(),
            _ => status == ComponentStatus::Terminated,
        }
    }

    /// Dispatch to the handler registered for this command's kind.
    pub fn accept<C, R>(&self, ctx: &mut C, table: &DispatchTable<C, R>) -> R {
        table.dispatch(self, ctx)
    }

    /// Apply the command's effect to the context entries.
    ///
    /// Only the chain terminal calls this, exactly once per attempt.
    pub(crate) fn perform(&self, ctx: &mut InvocationContext) -> CacheResult<CommandResult> {
        perform::perform(self, ctx)
    }
}

fn declared_load_type(kind: &CommandKind, flags: &Flags) -> Option<LoadType> {
    let ignore_return = flags.contains(Flag::IgnoreReturnValues);
    match kind {
        CommandKind::Size => None,
        CommandKind::Get { .. } => Some(LoadType::Owner),
        CommandKind::Put { .. } | CommandKind::Remove { .. } if ignore_return => {
            Some(LoadType::DontLoad)
        }
        CommandKind::Put { .. }
        | CommandKind::Remove { .. }
        | CommandKind::PutIfAbsent { .. }
        | CommandKind::Replace { .. }
        | CommandKind::ReplaceIfEquals { .. }
        | CommandKind::RemoveIfEquals { .. } => Some(LoadType::Primary),
        CommandKind::Increment { .. } | CommandKind::Append { .. } => Some(LoadType::Owner),
        CommandKind::ApplyValue { .. }
        | CommandKind::Invalidate { .. }
        | CommandKind::Clear
        | CommandKind::Prepare { .. }
        | CommandKind::Commit { .. }
        | CommandKind::Rollback { .. } => Some(LoadType::DontLoad),
    }
}
