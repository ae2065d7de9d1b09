//! Operation definitions: declared parameter types, the call context handed
//! to every invocation, and the typed errors an operation may return.

use std::fmt;
use std::sync::Arc;

use crate::bridge::protocol::{RequestId, Scalar};
use crate::skip::SkipSignal;
use crate::status::TaskStatusStore;

/// Declared type of one positional parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    Str,
    Int,
    Float,
    Bool,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure returned by an operation body.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OperationError {
    #[error("{message}")]
    Failed { message: String },

    #[error("argument {index}: expected {expected}, got {actual}")]
    BadArgument {
        index: usize,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("unavailable: {message}")]
    Unavailable { message: String },
}

impl OperationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Coerced positional arguments.
///
/// The dispatcher has already checked arity and converted every value to
/// its declared type, so the typed accessors only fail when an operation
/// reads an index with the wrong type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Scalar>);

impl Args {
    pub fn new(values: Vec<Scalar>) -> Self {
        Self(values)
    }

    pub fn get(&self, index: usize) -> Option<&Scalar> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<Scalar> {
        self.0
    }

    fn bad(&self, index: usize, expected: &'static str) -> OperationError {
        OperationError::BadArgument {
            index,
            expected,
            actual: self.0.get(index).map_or("missing", Scalar::type_name),
        }
    }

    pub fn str(&self, index: usize) -> Result<&str, OperationError> {
        self.get(index)
            .and_then(Scalar::as_str)
            .ok_or_else(|| self.bad(index, "string"))
    }

    pub fn int(&self, index: usize) -> Result<i64, OperationError> {
        self.get(index)
            .and_then(Scalar::as_i64)
            .ok_or_else(|| self.bad(index, "integer"))
    }

    pub fn float(&self, index: usize) -> Result<f64, OperationError> {
        self.get(index)
            .and_then(Scalar::as_f64)
            .ok_or_else(|| self.bad(index, "float"))
    }

    pub fn bool(&self, index: usize) -> Result<bool, OperationError> {
        self.get(index)
            .and_then(Scalar::as_bool)
            .ok_or_else(|| self.bad(index, "boolean"))
    }
}

impl From<Vec<Scalar>> for Args {
    fn from(values: Vec<Scalar>) -> Self {
        Self(values)
    }
}

/// Everything an operation may touch besides its arguments.
#[derive(Debug, Clone)]
pub struct CallContext {
    method: String,
    id: Option<RequestId>,
    status: Arc<TaskStatusStore>,
    skip: SkipSignal,
    signatures: Arc<[String]>,
}

impl CallContext {
    pub fn new(method: impl Into<String>, status: Arc<TaskStatusStore>, skip: SkipSignal) -> Self {
        Self {
            method: method.into(),
            id: None,
            status,
            skip,
            signatures: Arc::from(Vec::new()),
        }
    }

    pub fn with_request_id(mut self, id: Option<RequestId>) -> Self {
        self.id = id;
        self
    }

    pub(crate) fn with_signatures(mut self, signatures: Arc<[String]>) -> Self {
        self.signatures = signatures;
        self
    }

    /// Method name as sent by the controller.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.id.as_ref()
    }

    pub fn status(&self) -> &TaskStatusStore {
        &self.status
    }

    pub fn skip(&self) -> &SkipSignal {
        &self.skip
    }

    /// Signatures of every registered operation, in registration order.
    pub fn operation_signatures(&self) -> &[String] {
        &self.signatures
    }
}

pub type OperationFn = dyn Fn(&CallContext, Args) -> Result<Scalar, OperationError> + Send + Sync;

/// A named, arity-fixed unit of behaviour.
#[derive(Clone)]
pub struct Operation {
    name: String,
    params: Vec<ParamType>,
    description: String,
    func: Arc<OperationFn>,
}

impl Operation {
    pub fn new<F>(name: impl Into<String>, params: &[ParamType], func: F) -> Self
    where
        F: Fn(&CallContext, Args) -> Result<Scalar, OperationError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params: params.to_vec(),
            description: String::new(),
            func: Arc::new(func),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamType] {
        &self.params
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// `name(int, str)`.
    pub fn signature(&self) -> String {
        let params: Vec<&str> = self.params.iter().map(ParamType::as_str).collect();
        format!("{}({})", self.name, params.join(", "))
    }

    /// Signature followed by the description, when there is one.
    pub fn listing(&self) -> String {
        if self.description.is_empty() {
            self.signature()
        } else {
            format!("{} - {}", self.signature(), self.description)
        }
    }

    pub(crate) fn call(&self, ctx: &CallContext, args: Args) -> Result<Scalar, OperationError> {
        (self.func)(ctx, args)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CallContext {
        CallContext::new("test", Arc::new(TaskStatusStore::new()), SkipSignal::new())
    }

    #[test]
    fn signature_lists_param_types() {
        let op = Operation::new("walkTo", &[ParamType::Int, ParamType::Int], |_, _| {
            Ok(Scalar::from("SUCCESS"))
        });
        assert_eq!(op.arity(), 2);
        assert_eq!(op.signature(), "walkTo(int, int)");
        assert_eq!(op.listing(), "walkTo(int, int)");

        let op = op.with_description("walk to a tile");
        assert_eq!(op.listing(), "walkTo(int, int) - walk to a tile");
    }

    #[test]
    fn nullary_signature() {
        let op = Operation::new("helloWorld", &[], |_, _| Ok(Scalar::from("hi")));
        assert_eq!(op.signature(), "helloWorld()");
    }

    #[test]
    fn call_passes_context_and_args() {
        let op = Operation::new("greet", &[ParamType::Str], |ctx, args| {
            Ok(Scalar::from(format!("{} {}", ctx.method(), args.str(0)?)))
        });
        let out = op
            .call(&ctx(), Args::new(vec![Scalar::from("Bob")]))
            .unwrap();
        assert_eq!(out, Scalar::from("test Bob"));
    }

    #[test]
    fn typed_accessors_report_mismatches() {
        let args = Args::new(vec![Scalar::Int(3), Scalar::from("x")]);
        assert_eq!(args.int(0), Ok(3));
        assert_eq!(args.str(1), Ok("x"));

        assert_eq!(
            args.str(0).unwrap_err().to_string(),
            "argument 0: expected string, got integer"
        );
        assert_eq!(
            args.bool(5).unwrap_err(),
            OperationError::BadArgument {
                index: 5,
                expected: "boolean",
                actual: "missing",
            }
        );
    }

    #[test]
    fn failed_renders_bare_message() {
        assert_eq!(OperationError::failed("TIMEOUT").to_string(), "TIMEOUT");
        assert_eq!(
            OperationError::unavailable("no world").to_string(),
            "unavailable: no world"
        );
    }

    #[test]
    fn context_carries_request_id() {
        let ctx = ctx().with_request_id(Some(RequestId::Int(4)));
        assert_eq!(ctx.request_id(), Some(&RequestId::Int(4)));
        assert!(ctx.operation_signatures().is_empty());
    }
}
