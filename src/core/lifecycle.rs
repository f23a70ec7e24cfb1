//! Component status and lifecycle callbacks.
//!
//! The cache moves through `Instantiated → Initializing → Running →
//! Stopping → Terminated` (or `Failed`). Callbacks registered with
//! [`LifecycleHooks`] run at two boundaries only: once initialization has
//! completed, and when shutdown begins. Lower priorities run first; hooks
//! with equal priority run in registration order.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Default callback priority.
pub const DEFAULT_HOOK_PRIORITY: i32 = 10;

/// Status of a cache component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentStatus {
    /// Constructed, not yet started.
    Instantiated,
    /// Start in progress.
    Initializing,
    /// Accepting invocations.
    Running,
    /// Shutdown in progress.
    Stopping,
    /// Shut down.
    Terminated,
    /// Start or stop failed.
    Failed,
}

impl ComponentStatus {
    /// Whether invocations may be accepted in this status.
    pub fn allows_invocations(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether the component is on its way down or already gone.
    pub fn is_stopping_or_stopped(&self) -> bool {
        matches!(self, Self::Stopping | Self::Terminated | Self::Failed)
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Instantiated => 0,
            Self::Initializing => 1,
            Self::Running => 2,
            Self::Stopping => 3,
            Self::Terminated => 4,
            Self::Failed => 5,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Instantiated,
            1 => Self::Initializing,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Terminated,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instantiated => write!(f, "instantiated"),
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Terminated => write!(f, "terminated"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Lock-free status cell shared between the node and its chain stages.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: ComponentStatus) -> Self {
        Self(AtomicU8::new(status.as_u8()))
    }

    pub fn get(&self) -> ComponentStatus {
        ComponentStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: ComponentStatus) {
        self.0.store(status.as_u8(), Ordering::Release);
    }
}

/// Lifecycle boundary at which hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// All components are wired and the cache is about to accept traffic.
    InitComplete,
    /// Shutdown has been requested; the cache still holds its data.
    ShutdownBegin,
}

type Hook = Box<dyn Fn() + Send + Sync>;

struct RegisteredHook {
    name: String,
    priority: i32,
    seq: usize,
    phase: LifecyclePhase,
    hook: Hook,
}

/// Ordered callback registry invoked at lifecycle boundaries.
#[derive(Default)]
pub struct LifecycleHooks {
    hooks: Vec<RegisteredHook>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook with the default priority.
    pub fn on(
        &mut self,
        phase: LifecyclePhase,
        name: impl Into<String>,
        hook: impl Fn() + Send + Sync + 'static,
    ) {
        self.on_with_priority(phase, name, DEFAULT_HOOK_PRIORITY, hook);
    }

    /// Register a hook with an explicit priority.
    pub fn on_with_priority(
        &mut self,
        phase: LifecyclePhase,
        name: impl Into<String>,
        priority: i32,
        hook: impl Fn() + Send + Sync + 'static,
    ) {
        let seq = self.hooks.len();
        self.hooks.push(RegisteredHook {
            name: name.into(),
            priority,
            seq,
            phase,
            hook: Box::new(hook),
        });
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook registered for `phase`, in priority order.
    pub fn fire(&self, phase: LifecyclePhase) {
        let mut due: Vec<&RegisteredHook> =
            self.hooks.iter().filter(|h| h.phase == phase).collect();
        due.sort_by_key(|h| (h.priority, h.seq));

        for hook in due {
            tracing::debug!(hook = %hook.name, priority = hook.priority, ?phase, "running lifecycle hook");
            (hook.hook)();
        }
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("hooks", &self.hooks.iter().map(|h| &h.name).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_status_cell_round_trip() {
        let cell = StatusCell::new(ComponentStatus::Instantiated);
        for status in [
            ComponentStatus::Initializing,
            ComponentStatus::Running,
            ComponentStatus::Stopping,
            ComponentStatus::Terminated,
            ComponentStatus::Failed,
        ] {
            cell.set(status);
            assert_eq!(cell.get(), status);
        }
    }

    #[test]
    fn test_hooks_run_in_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = LifecycleHooks::new();

        let o = order.clone();
        hooks.on(LifecyclePhase::InitComplete, "default", move || o.lock().push("default"));
        let o = order.clone();
        hooks.on_with_priority(LifecyclePhase::InitComplete, "early", 1, move || {
            o.lock().push("early")
        });
        let o = order.clone();
        hooks.on_with_priority(LifecyclePhase::ShutdownBegin, "stop", 0, move || {
            o.lock().push("stop")
        });
        let o = order.clone();
        hooks.on(LifecyclePhase::InitComplete, "default-2", move || {
            o.lock().push("default-2")
        });

        hooks.fire(LifecyclePhase::InitComplete);
        assert_eq!(*order.lock(), vec!["early", "default", "default-2"]);

        hooks.fire(LifecyclePhase::ShutdownBegin);
        assert_eq!(order.lock().last(), Some(&"stop"));
    }
}
