//! Networking layer.
//!
//! This module carries commands and remote loads between nodes:
//! - [`transport`] - Transport and inbound handler contracts, timeouts
//! - [`local`] - In-process cluster transport used by the runtime and tests
//!
//! RPC framing is out of scope; any transport that can deliver a
//! [`Command`](crate::commands::Command) and a remote load plugs in through
//! [`transport::Transport`].

pub mod local;
pub mod transport;

pub use local::LocalCluster;
pub use transport::{InboundHandler, Transport, TransportFuture};
