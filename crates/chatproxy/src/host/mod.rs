//! Host side: owns the worker process and correlates responses.
//!
//! Many callers share one [`ProcessChannel`](channel::ProcessChannel). Each
//! worker generation has exactly one reader task that routes responses into
//! per-request slots.

pub mod channel;
pub mod client;
pub mod connection;
pub mod pending;
pub mod spawner;
pub mod transport;
