//! Request dispatch: resolve, coerce, invoke, and build exactly one response.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use crate::bridge::protocol::{Request, RequestId, Response, Scalar};
use crate::operation::{Args, CallContext, OperationError, ParamType};
use crate::registry::{MethodRegistry, ResolveError};
use crate::skip::SkipSignal;
use crate::status::TaskStatusStore;

/// An argument that cannot be converted to its declared type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid argument {index}: {reason}")]
pub struct CoercionError {
    pub index: usize,
    pub reason: String,
}

impl CoercionError {
    fn mismatch(index: usize, expected: ParamType, got: &Scalar) -> Self {
        let got = match got {
            Scalar::Str(s) => format!("string {:?}", s),
            other => format!("{} {}", other.type_name(), other),
        };
        Self {
            index,
            reason: format!("expected {}, got {}", expected, got),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Coercion(#[from] CoercionError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error("operation '{name}' panicked: {message}")]
    Panicked { name: String, message: String },

    #[error("operation '{name}' returned a non-finite number")]
    NonFinite { name: String },
}

/// Convert one wire scalar to a declared parameter type.
pub fn coerce(index: usize, value: Scalar, expected: ParamType) -> Result<Scalar, CoercionError> {
    let coerced = match (expected, &value) {
        (ParamType::Int, Scalar::Int(_))
        | (ParamType::Float, Scalar::Float(_))
        | (ParamType::Bool, Scalar::Bool(_))
        | (ParamType::Str, Scalar::Str(_)) => Some(value.clone()),

        (ParamType::Int, Scalar::Float(f)) => float_to_int(*f).map(Scalar::Int),
        (ParamType::Int, Scalar::Str(s)) => s.trim().parse::<i64>().ok().map(Scalar::Int),

        (ParamType::Float, Scalar::Int(n)) => Some(Scalar::Float(*n as f64)),
        (ParamType::Float, Scalar::Str(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Scalar::Float),

        (ParamType::Bool, Scalar::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(Scalar::Bool(true)),
            "false" => Some(Scalar::Bool(false)),
            _ => None,
        },

        (ParamType::Str, other) => Some(Scalar::Str(other.to_string())),

        _ => None,
    };

    coerced.ok_or_else(|| CoercionError::mismatch(index, expected, &value))
}

fn float_to_int(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Owns the frozen registry and the state injected into every call.
#[derive(Debug)]
pub struct Dispatcher {
    registry: MethodRegistry,
    status: Arc<TaskStatusStore>,
    skip: SkipSignal,
    signatures: Arc<[String]>,
}

impl Dispatcher {
    pub fn new(registry: MethodRegistry, status: Arc<TaskStatusStore>, skip: SkipSignal) -> Self {
        let signatures: Vec<String> = registry.operations().map(|op| op.listing()).collect();
        Self {
            registry,
            status,
            skip,
            signatures: Arc::from(signatures),
        }
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    pub fn status(&self) -> &Arc<TaskStatusStore> {
        &self.status
    }

    /// Handle one request. Never panics and always answers.
    pub fn dispatch(&self, request: Request) -> Response {
        let started = Instant::now();
        let Request { method, args, id } = request;

        let outcome = self.invoke(&method, args, id.clone());
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                tracing::debug!(method = %method, id = ?id, duration_ms, "Request handled");
                Response::success(id, method, result)
            }
            Err(e) => {
                match &e {
                    DispatchError::Panicked { .. } => {
                        tracing::error!(method = %method, id = ?id, duration_ms, error = %e, "Operation panicked")
                    }
                    _ => {
                        tracing::info!(method = %method, id = ?id, duration_ms, error = %e, "Request failed")
                    }
                }
                Response::failure(id, method, e.to_string())
            }
        }
    }

    /// Resolve, coerce and call. The response-shaping half lives in [`dispatch`](Self::dispatch).
    pub fn invoke(
        &self,
        method: &str,
        args: Vec<Scalar>,
        id: Option<RequestId>,
    ) -> Result<Scalar, DispatchError> {
        let operation = self.registry.resolve(method, args.len())?;

        let coerced = args
            .into_iter()
            .zip(operation.params())
            .enumerate()
            .map(|(index, (value, expected))| coerce(index, value, *expected))
            .collect::<Result<Vec<_>, _>>()?;

        let ctx = CallContext::new(method, Arc::clone(&self.status), self.skip.clone())
            .with_request_id(id)
            .with_signatures(Arc::clone(&self.signatures));

        let span = tracing::info_span!("operation", method = %method);
        let _guard = span.enter();

        let result = match catch_unwind(AssertUnwindSafe(|| operation.call(&ctx, Args::new(coerced)))) {
            Ok(result) => result?,
            Err(payload) => {
                return Err(DispatchError::Panicked {
                    name: operation.name().to_string(),
                    message: panic_message(payload.as_ref()),
                });
            }
        };

        // JSON has no NaN or infinity.
        if let Scalar::Float(f) = result
            && !f.is_finite()
        {
            return Err(DispatchError::NonFinite {
                name: operation.name().to_string(),
            });
        }
        Ok(result)
    }
}
