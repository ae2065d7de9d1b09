//! Wire layer between the controller and the bridge.
//!
//! This module provides the message types and line codec shared by the
//! bridge's listener and the controller client.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Response, Scalar)
//! - **codec**: Newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
