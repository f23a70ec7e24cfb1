//! Kind-based dispatch.
//!
//! A [`DispatchTable`] maps a [`CommandTag`] to a handler function and falls
//! back to a default handler for kinds it does not list. Stages that need
//! kind-specific behaviour build one table at construction time; adding a
//! command kind never requires touching tables that are happy with the
//! fallback.

use crate::commands::{Command, CommandTag};
use std::collections::HashMap;

/// Handler invoked for one command kind.
pub type Handler<C, R> = fn(&Command, &mut C) -> R;

/// Command kind → handler, with a fallback.
pub struct DispatchTable<C, R> {
    handlers: HashMap<CommandTag, Handler<C, R>>,
    fallback: Handler<C, R>,
}

impl<C, R> DispatchTable<C, R> {
    /// Create a table where every kind uses `fallback`.
    pub fn new(fallback: Handler<C, R>) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback,
        }
    }

    /// Register a handler for one kind.
    pub fn with(mut self, tag: CommandTag, handler: Handler<C, R>) -> Self {
        self.handlers.insert(tag, handler);
        self
    }

    /// Register one handler for several kinds.
    pub fn with_all(mut self, tags: &[CommandTag], handler: Handler<C, R>) -> Self {
        for tag in tags {
            self.handlers.insert(*tag, handler);
        }
        self
    }

    /// Whether `tag` has its own handler.
    pub fn handles(&self, tag: CommandTag) -> bool {
        self.handlers.contains_key(&tag)
    }

    /// Handler for `tag`, or the fallback.
    pub fn handler_for(&self, tag: CommandTag) -> Handler<C, R> {
        self.handlers.get(&tag).copied().unwrap_or(self.fallback)
    }

    /// Invoke the handler for `command`.
    pub fn dispatch(&self, command: &Command, ctx: &mut C) -> R {
        (self.handler_for(command.tag()))(command, ctx)
    }
}

impl<C, R> std::fmt::Debug for DispatchTable<C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.handlers.keys().collect();
        tags.sort();
        f.debug_struct("DispatchTable").field("handlers", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback(_: &Command, seen: &mut Vec<&'static str>) -> &'static str {
        seen.push("fallback");
        "fallback"
    }

    fn on_put(_: &Command, seen: &mut Vec<&'static str>) -> &'static str {
        seen.push("put");
        "put"
    }

    #[test]
    fn test_registered_handler_wins() {
        let table: DispatchTable<Vec<&'static str>, &'static str> =
            DispatchTable::new(fallback).with(CommandTag::Put, on_put);
        let mut seen = Vec::new();

        assert_eq!(Command::put("k", "v").accept(&mut seen, &table), "put");
        assert_eq!(Command::get("k").accept(&mut seen, &table), "fallback");
        assert_eq!(seen, vec!["put", "fallback"]);
    }

    #[test]
    fn test_unlisted_kinds_use_fallback() {
        let table: DispatchTable<Vec<&'static str>, &'static str> = DispatchTable::new(fallback)
            .with_all(&[CommandTag::Put, CommandTag::Remove], on_put);
        assert!(table.handles(CommandTag::Remove));
        for tag in CommandTag::ALL {
            if tag != CommandTag::Put && tag != CommandTag::Remove {
                assert!(!table.handles(tag));
            }
        }
    }
}
