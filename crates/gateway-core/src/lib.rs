//! Core runtime for the agent gateway: priority task queue, per-task message
//! buffer, durable scheduler, persistent memory coordinator, and the
//! `GatewayService` composition root tying them to one agent driver.

pub mod config;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod message;
pub mod scheduler;
pub mod task;

pub use driver::AgentDriver;
pub use error::TaskError;
pub use gateway::GatewayService;
