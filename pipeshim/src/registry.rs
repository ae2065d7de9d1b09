//! Name/arity table of the operations a bridge exposes.
//!
//! Built once at startup from builtins and an [`OperationProvider`], then
//! frozen inside the dispatcher.

use indexmap::IndexMap;

use crate::bridge::protocol::Scalar;
use crate::operation::{Args, CallContext, Operation, OperationError, ParamType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("operation '{name}' with {arity} argument(s) is already registered")]
    Duplicate { name: String, arity: usize },

    #[error("operation name must not be empty")]
    EmptyName,
}

/// Why a request could not be matched to an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("method not found: {name}")]
    UnknownMethod { name: String },

    #[error(
        "method not found: {name} with {got} argument(s) (expected {})",
        .expected.join(" or ")
    )]
    ArityMismatch {
        name: String,
        got: usize,
        expected: Vec<String>,
    },
}

/// Source of operations registered at bridge startup.
pub trait OperationProvider {
    fn register(&self, registry: &mut MethodRegistry) -> Result<(), RegistryError>;
}

impl<F> OperationProvider for F
where
    F: Fn(&mut MethodRegistry) -> Result<(), RegistryError>,
{
    fn register(&self, registry: &mut MethodRegistry) -> Result<(), RegistryError> {
        self(registry)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MethodRegistry {
    operations: IndexMap<String, Vec<Operation>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, operation: Operation) -> Result<(), RegistryError> {
        if operation.name().is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let overloads = self
            .operations
            .entry(operation.name().to_string())
            .or_default();
        if overloads.iter().any(|op| op.arity() == operation.arity()) {
            return Err(RegistryError::Duplicate {
                name: operation.name().to_string(),
                arity: operation.arity(),
            });
        }

        tracing::debug!(signature = %operation.signature(), "Registered operation");
        overloads.push(operation);
        Ok(())
    }

    /// Shorthand for [`register`](Self::register) with a bare closure.
    pub fn register_fn<F>(
        &mut self,
        name: &str,
        params: &[ParamType],
        func: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&CallContext, Args) -> Result<Scalar, OperationError> + Send + Sync + 'static,
    {
        self.register(Operation::new(name, params, func))
    }

    /// Exact name match, then the first overload whose arity equals `argc`.
    pub fn resolve(&self, name: &str, argc: usize) -> Result<&Operation, ResolveError> {
        let overloads = self
            .operations
            .get(name)
            .ok_or_else(|| ResolveError::UnknownMethod {
                name: name.to_string(),
            })?;

        overloads
            .iter()
            .find(|op| op.arity() == argc)
            .ok_or_else(|| ResolveError::ArityMismatch {
                name: name.to_string(),
                got: argc,
                expected: overloads.iter().map(Operation::signature).collect(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// All operations in registration order, overloads grouped by name.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values().flatten()
    }

    /// Number of registered operations, counting each overload.
    pub fn len(&self) -> usize {
        self.operations.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
