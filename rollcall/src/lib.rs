pub mod command;
pub mod config;
pub mod correlation;
pub mod entity;
pub mod error;
pub mod http;
pub mod membership;
pub mod metrics;
pub mod raft;
pub mod server;
pub mod service;
pub mod state_machine;
pub mod store;

#[cfg(test)]
mod testkit;
