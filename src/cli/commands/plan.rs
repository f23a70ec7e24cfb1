//! Plan command implementation.
//!
//! Prints the load decision a command kind gets for each ownership role,
//! without starting a node.

use crate::commands::{
    resolve, Command, CommandKind, CommandTag, Flag, Key, LoadDecision, LoadQuery, TxId,
};
use crate::control::ownership::OwnershipRole;
use crate::core::config::CacheMode;
use anyhow::Result;
use clap::Args;
use serde::Serialize;

/// Show the load decision for a command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Command kind (get, put, increment, ...).
    #[arg(long)]
    pub kind: CommandTag,

    /// Cache mode.
    #[arg(long, default_value = "dist-sync")]
    pub mode: CacheMode,

    /// Plan the command inside a transaction.
    #[arg(long)]
    pub tx: bool,

    /// Plan the command as received from another node.
    #[arg(long)]
    pub remote: bool,

    /// Mark the command as not needing its return value.
    #[arg(long)]
    pub ignore_return_values: bool,

    /// Only show this role (primary, backup, not-owner).
    #[arg(long)]
    pub role: Option<OwnershipRole>,

    /// Output format (text, json).
    #[arg(long, default_value = "text")]
    pub format: String,
}

#[derive(Debug, Serialize)]
struct PlanRow {
    role: OwnershipRole,
    #[serde(flatten)]
    decision: LoadDecision,
}

/// Run the plan command.
pub fn run_plan(args: PlanArgs) -> Result<()> {
    let mut command = sample_command(args.kind);
    if args.ignore_return_values {
        command = command.flag(Flag::IgnoreReturnValues);
    }
    let load_type = command.load_type()?;

    let roles = match args.role {
        Some(role) => vec![role],
        None => vec![
            OwnershipRole::Primary,
            OwnershipRole::Backup,
            OwnershipRole::NotOwner,
        ],
    };
    let rows: Vec<PlanRow> = roles
        .into_iter()
        .map(|role| PlanRow {
            role,
            decision: resolve(&LoadQuery {
                load_type,
                cache_mode: args.mode,
                transactional: args.tx,
                role,
                originator: !args.remote,
            }),
        })
        .collect();

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        "text" => {
            println!(
                "{} ({}) in {}{}{}",
                args.kind,
                load_type,
                args.mode,
                if args.tx { ", transactional" } else { "" },
                if args.remote { ", remote" } else { ", originator" },
            );
            for row in &rows {
                let decision = &row.decision;
                let load = if decision.must_load {
                    format!("load from {:?}", decision.source)
                } else {
                    "no load".to_string()
                };
                let skew = if decision.verify_write_skew {
                    " + write-skew check"
                } else {
                    ""
                };
                println!("  {:<10} {}{}", row.role, load, skew);
            }
        }
        other => anyhow::bail!("unknown format: {} (expected text or json)", other),
    }
    Ok(())
}

/// A representative command of a kind.
fn sample_command(tag: CommandTag) -> Command {
    let key = Key::from_static(b"key");
    match tag {
        CommandTag::Get => Command::get(key),
        CommandTag::Size => Command::size(),
        CommandTag::Put => Command::put(key, "value"),
        CommandTag::PutIfAbsent => Command::put_if_absent(key, "value"),
        CommandTag::Replace => Command::replace(key, "value"),
        CommandTag::ReplaceIfEquals => Command::replace_if_equals(key, "old", "value"),
        CommandTag::Remove => Command::remove(key),
        CommandTag::RemoveIfEquals => Command::remove_if_equals(key, "old"),
        CommandTag::Increment => Command::increment(key, 1),
        CommandTag::Append => Command::append(key, "suffix"),
        CommandTag::ApplyValue => Command::apply_value(key, None, 0, None),
        CommandTag::Invalidate => Command::invalidate(vec![key]),
        CommandTag::Clear => Command::clear(),
        CommandTag::Prepare | CommandTag::Commit | CommandTag::Rollback => {
            // Transaction control never loads; a rollback stands for all three.
            Command::new(CommandKind::Rollback {
                tx_id: TxId {
                    origin: "plan".into(),
                    seq: 0,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::LoadType;

    #[test]
    fn test_every_kind_has_a_sample() {
        for tag in CommandTag::ALL {
            let command = sample_command(tag);
            if tag != CommandTag::Prepare && tag != CommandTag::Commit {
                assert_eq!(command.tag(), tag);
            }
        }
        assert_eq!(
            sample_command(CommandTag::Increment).load_type().unwrap(),
            LoadType::Owner
        );
    }

    #[test]
    fn test_size_plan_is_rejected() {
        let args = PlanArgs {
            kind: CommandTag::Size,
            mode: CacheMode::DistSync,
            tx: false,
            remote: false,
            ignore_return_values: false,
            role: None,
            format: "text".to_string(),
        };
        assert!(run_plan(args).is_err());
    }
}
