//! CLI command implementations.

mod config;
mod plan;
mod start;

pub use config::{run_config, ConfigArgs};
pub use plan::{run_plan, PlanArgs};
pub use start::{init_tracing, run_start_with_config, StartArgs};
