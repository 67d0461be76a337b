pub use crate::clock::*;
pub use crate::config::NodeConfig;
pub use crate::coordinator::*;
pub use crate::error::{Error, Result};
pub use crate::message::*;
pub use crate::node::Node;

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod deferred;
pub mod error;
pub mod log;
pub mod message;
pub mod net;
pub mod node;
pub mod peer;
pub mod poisson;
pub mod rpc;
pub mod server;

/// Default number of critical-section requests per second issued by the demo.
pub const RATE: f64 = 1.;
