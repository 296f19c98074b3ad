#[macro_use]
extern crate slog;
#[macro_use]
extern crate serde_derive;

pub mod appender;
pub mod candidate;
pub mod client;
pub mod cluster;
pub mod config;
pub mod election;
pub mod follower;
pub mod fsm;
pub mod inactive;
pub mod leader;
pub mod log;
pub mod membership;
pub mod meta;
pub mod passive;
pub mod progress;
pub mod raft;
pub mod reserve;
pub mod rpc;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod tcp;

pub use crate::client::RaftClient;
pub use crate::fsm::Fsm;
pub use crate::server::HuckRaft;
