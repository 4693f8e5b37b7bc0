//! IPC bridge for host-worker communication.
//!
//! This module provides the wire protocol and codec for communication between
//! the host (parent) and the worker subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types (Request, Response) and command payloads
//! - **codec**: base64 line framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
