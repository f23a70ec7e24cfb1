//! Command effects.
//!
//! Effects are applied to the invocation context entries, never to the
//! container directly; the entry stage commits whatever the effect changed.
//! `Invalidate`, `Clear` and `Size` are the exceptions: they act on the
//! whole container and carry no entries.

use crate::commands::{Command, CommandKind, CommandResult, Flag, Key, LoadType, Value};
use crate::core::error::{display_key, CacheError, CacheResult};
use crate::invocation::context::InvocationContext;
use bytes::{BufMut, BytesMut};

pub(super) fn perform(command: &Command, ctx: &mut InvocationContext) -> CacheResult<CommandResult> {
    match command.kind() {
        CommandKind::Size => Ok(CommandResult::Size(ctx.container().len())),
        CommandKind::Invalidate { keys } => {
            let dropped = ctx.container().invalidate(keys);
            tracing::debug!(keys = keys.len(), dropped, "invalidated");
            Ok(CommandResult::Done)
        }
        CommandKind::Clear => {
            ctx.container().clear();
            Ok(CommandResult::Done)
        }
        CommandKind::Prepare { .. } | CommandKind::Rollback { .. } => Ok(CommandResult::Done),
        CommandKind::Commit { writes, .. } => {
            for write in writes {
                let Some(key) = write.key() else {
                    return Err(CacheError::invalid("transaction write without a key"));
                };
                // Delta writes are recomputed from each owner's own value.
                if write.command.load_type()? == LoadType::Owner {
                    apply(&write.command, ctx)?;
                } else {
                    ctx.set(key.clone(), write.final_value.clone());
                }
            }
            Ok(CommandResult::Done)
        }
        _ => apply(command, ctx),
    }
}

/// Single-key effect against the context entry of the command's key.
fn apply(command: &Command, ctx: &mut InvocationContext) -> CacheResult<CommandResult> {
    let returns = !command.has_flag(Flag::IgnoreReturnValues);

    match command.kind() {
        CommandKind::Get { key } => Ok(CommandResult::Value(ctx.current(key))),

        CommandKind::Put { key, value } => {
            let previous = ctx.current(key);
            ctx.set(key.clone(), Some(value.clone()));
            Ok(CommandResult::Value(previous.filter(|_| returns)))
        }

        CommandKind::PutIfAbsent { key, value } => {
            let previous = ctx.current(key);
            let success = previous.is_none();
            if success {
                ctx.set(key.clone(), Some(value.clone()));
            }
            Ok(CommandResult::Conditional { success, previous })
        }

        CommandKind::Replace { key, value } => {
            let previous = ctx.current(key);
            let success = previous.is_some();
            if success {
                ctx.set(key.clone(), Some(value.clone()));
            }
            Ok(CommandResult::Conditional { success, previous })
        }

        CommandKind::ReplaceIfEquals {
            key,
            expected,
            value,
        } => {
            let previous = ctx.current(key);
            let success = previous.as_ref() == Some(expected);
            if success {
                ctx.set(key.clone(), Some(value.clone()));
            }
            Ok(CommandResult::Conditional { success, previous })
        }

        CommandKind::Remove { key } => {
            let previous = ctx.current(key);
            ctx.set(key.clone(), None);
            Ok(CommandResult::Value(previous.filter(|_| returns)))
        }

        CommandKind::RemoveIfEquals { key, expected } => {
            let previous = ctx.current(key);
            let success = previous.as_ref() == Some(expected);
            if success {
                ctx.set(key.clone(), None);
            }
            Ok(CommandResult::Conditional { success, previous })
        }

        CommandKind::Increment { key, delta } => {
            let current = parse_counter(key, ctx.current(key))?;
            let next = current.checked_add(*delta).ok_or_else(|| {
                CacheError::invalid(format!("counter overflow on key {}", display_key(key)))
            })?;
            ctx.set(key.clone(), Some(Value::from(next.to_string())));
            Ok(CommandResult::Counter(next))
        }

        CommandKind::Append { key, suffix } => {
            let current = ctx.current(key).unwrap_or_default();
            let mut joined = BytesMut::with_capacity(current.len() + suffix.len());
            joined.put_slice(&current);
            joined.put_slice(suffix);
            let joined = joined.freeze();
            ctx.set(key.clone(), Some(joined.clone()));
            Ok(CommandResult::Value(Some(joined)))
        }

        CommandKind::ApplyValue { key, value } => {
            ctx.set(key.clone(), value.clone());
            Ok(CommandResult::Done)
        }

        _ => Err(CacheError::invalid(format!(
            "{} is not a single-key command",
            command.tag()
        ))),
    }
}

fn parse_counter(key: &Key, value: Option<Value>) -> CacheResult<i64> {
    let Some(value) = value else {
        return Ok(0);
    };
    std::str::from_utf8(&value)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            CacheError::invalid(format!(
                "value of key {} is not an integer",
                display_key(key)
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::topology::NodeId;
    use crate::invocation::context::InvocationContext;
    use crate::storage::DataContainer;
    use std::sync::Arc;

    fn ctx_with(container: &Arc<DataContainer>) -> InvocationContext {
        let mut ctx = InvocationContext::local(NodeId::from("a"), container.clone(), false);
        for key in ["k", "n"] {
            let key = Key::from_static(key.as_bytes());
            let loaded = container.load(&key);
            ctx.record_load(key, loaded);
        }
        ctx
    }

    #[test]
    fn test_put_returns_previous_unless_ignored() {
        let container = Arc::new(DataContainer::new());
        container.commit(Key::from_static(b"k"), Some(Value::from_static(b"old")), None);

        let mut ctx = ctx_with(&container);
        let result = perform(&Command::put("k", "new"), &mut ctx).unwrap();
        assert_eq!(result, CommandResult::Value(Some(Value::from_static(b"old"))));

        let mut ctx = ctx_with(&container);
        let ignored = Command::put("k", "new").flag(Flag::IgnoreReturnValues);
        assert_eq!(perform(&ignored, &mut ctx).unwrap(), CommandResult::Value(None));
        assert_eq!(ctx.current(&Key::from_static(b"k")), Some(Value::from_static(b"new")));
    }

    #[test]
    fn test_conditional_mismatch_is_a_result() {
        let container = Arc::new(DataContainer::new());
        container.commit(Key::from_static(b"k"), Some(Value::from_static(b"v1")), None);
        let mut ctx = ctx_with(&container);

        let result = perform(&Command::put_if_absent("k", "v2"), &mut ctx).unwrap();
        assert!(!result.is_successful());
        assert_eq!(result.value(), Some(&Value::from_static(b"v1")));
        assert!(ctx.changed_entries().is_empty());

        let result = perform(&Command::replace_if_equals("k", "v1", "v3"), &mut ctx).unwrap();
        assert!(result.is_successful());
        assert_eq!(ctx.changed_entries().len(), 1);
    }

    #[test]
    fn test_increment_and_append() {
        let container = Arc::new(DataContainer::new());
        let mut ctx = ctx_with(&container);

        assert_eq!(
            perform(&Command::increment("n", 5), &mut ctx).unwrap(),
            CommandResult::Counter(5)
        );
        assert_eq!(
            perform(&Command::increment("n", -2), &mut ctx).unwrap(),
            CommandResult::Counter(3)
        );

        perform(&Command::append("k", "ab"), &mut ctx).unwrap();
        let result = perform(&Command::append("k", "cd"), &mut ctx).unwrap();
        assert_eq!(result.value(), Some(&Value::from_static(b"abcd")));
    }

    #[test]
    fn test_increment_rejects_non_numeric() {
        let container = Arc::new(DataContainer::new());
        container.commit(Key::from_static(b"n"), Some(Value::from_static(b"abc")), None);
        let mut ctx = ctx_with(&container);

        let err = perform(&Command::increment("n", 1), &mut ctx).unwrap_err();
        assert!(matches!(err, CacheError::InvalidCommand { .. }));
        assert!(ctx.changed_entries().is_empty());
    }

    #[test]
    fn test_container_wide_commands() {
        let container = Arc::new(DataContainer::new());
        container.commit(Key::from_static(b"a"), Some(Value::from_static(b"1")), None);
        container.commit(Key::from_static(b"b"), Some(Value::from_static(b"2")), None);
        let mut ctx = InvocationContext::local(NodeId::from("a"), container.clone(), false);

        assert_eq!(perform(&Command::size(), &mut ctx).unwrap(), CommandResult::Size(2));
        perform(&Command::invalidate(vec![Key::from_static(b"a")]), &mut ctx).unwrap();
        assert_eq!(container.len(), 1);
        perform(&Command::clear(), &mut ctx).unwrap();
        assert!(container.is_empty());
    }
}
