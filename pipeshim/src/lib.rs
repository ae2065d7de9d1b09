//! pipeshim: line-delimited JSON RPC bridge over a pair of named pipes.

pub mod bridge;
pub mod builtin;
pub mod config;
pub mod dispatcher;
pub mod operation;
pub mod registry;
pub mod skip;
pub mod status;
pub mod wait;

#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod lifecycle;
#[cfg(unix)]
pub mod transport;

pub use bridge::codec::{DecodeError, JsonLineCodec, MAX_LINE_LENGTH, decode_line, encode_line};
pub use bridge::protocol::{Outcome, Request, RequestId, Response, Scalar, UNKNOWN_METHOD};
pub use config::{BridgeConfig, ConfigError};
pub use dispatcher::{CoercionError, DispatchError, Dispatcher};
pub use operation::{Args, CallContext, Operation, OperationError, ParamType};
pub use registry::{MethodRegistry, OperationProvider, RegistryError, ResolveError};
pub use skip::SkipSignal;
pub use status::{IDLE_STEP, StatusSnapshot, TaskStatusStore, format_elapsed};
pub use wait::{WaitOutcome, wait_until, wait_until_or_skipped};

#[cfg(unix)]
pub use client::{ClientError, Controller};
#[cfg(unix)]
pub use lifecycle::{Bridge, BridgeError};
#[cfg(unix)]
pub use transport::{PipeTransport, TransportError};
