//! Local broker fabric that lets AI coding assistants drive a running
//! browser's Claude.ai tabs: a loopback WebSocket hub routing requests
//! between a single browser extension and many CLI/MCP host peers.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod env;
pub mod error;
pub mod framing;
pub mod hub;
pub mod hub_client;
pub mod operation;
pub mod process;
pub mod protocol;
pub mod resource;
pub mod statefile;
pub mod supervisor;
pub mod ws;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{BridgeError, ErrorKind};
pub use hub::Hub;
pub use hub_client::HubClient;
pub use operation::OperationManager;
pub use resource::ResourceStateManager;
pub use supervisor::LifecycleSupervisor;
