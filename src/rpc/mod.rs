//! Agent RPC: mutually authenticated command dispatch between the driver
//! and the per-node agents.

pub mod client;
pub mod server;

pub use client::AgentRunner;
pub use server::{AgentServer, AgentServerConfig, AgentState};

pub mod proto {
    pub mod agent {
        tonic::include_proto!("agent");
    }
}

/// Well-known agent listener port.
pub const AGENT_PORT: u16 = 3012;
