//! AS4 Message Service Handler Runtime
//!
//! Assembles the processing core into a running message service handler:
//! the concrete receive, error and send pipelines, the [`Msh`] facade the
//! HTTP layer calls into, and the supervised background agents that send,
//! deliver, notify, pull and sweep.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod agents;
pub mod builder;
pub mod codec;
pub mod msh;
pub mod pipelines;
pub mod services;
pub mod steps;
pub mod supervisor;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use agents::{
    Agent, AwarenessSweepAgent, DeliverAgent, NotifyAgent, PullAgent, RetrySweepAgent, SendAgent,
};
pub use builder::{MshBuilder, RuntimeHandle};
pub use codec::{JsonCodec, JSON_CONTENT_TYPE};
pub use msh::{Msh, SendOutcome};
pub use services::{NoSecurity, NoTransport, Services};
pub use supervisor::{AgentEvent, AgentHealth, AgentHealthStatus, Supervisor};
