//! Error types for kernel binding and execution

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::ContextId;
use crate::memory::Capability;

/// Result type for kernel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which side of the parameter count a call fell on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArityProblem {
    NotEnough,
    TooMany,
}

impl fmt::Display for ArityProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArityProblem::NotEnough => f.write_str("not enough parameters"),
            ArityProblem::TooMany => f.write_str("too many parameters"),
        }
    }
}

/// Backend failure codes, translated from whatever the driver reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendStatus {
    DeviceNotAvailable,
    OutOfResources,
    OutOfHostMemory,
    InvalidValue,
    InvalidKernelArgs,
    InvalidWorkGroupSize,
    InvalidEvent,
    CompileFailed,
    ExecutionFailed,
    Unsupported,
    Unknown,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendStatus::DeviceNotAvailable => "DEVICE_NOT_AVAILABLE",
            BackendStatus::OutOfResources => "OUT_OF_RESOURCES",
            BackendStatus::OutOfHostMemory => "OUT_OF_HOST_MEMORY",
            BackendStatus::InvalidValue => "INVALID_VALUE",
            BackendStatus::InvalidKernelArgs => "INVALID_KERNEL_ARGS",
            BackendStatus::InvalidWorkGroupSize => "INVALID_WORK_GROUP_SIZE",
            BackendStatus::InvalidEvent => "INVALID_EVENT",
            BackendStatus::CompileFailed => "COMPILE_FAILED",
            BackendStatus::ExecutionFailed => "EXECUTION_FAILED",
            BackendStatus::Unsupported => "UNSUPPORTED",
            BackendStatus::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Errors raised while describing, binding or launching kernels
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Wrong number of arguments passed to `bind`
    #[error("error in calling compute function '{kernel}': {problem} ({expected} declared, {supplied} supplied)")]
    Arity {
        kernel: String,
        problem: ArityProblem,
        expected: usize,
        supplied: usize,
    },

    /// Grid length does not match the kernel's dimensionality
    #[error("kernel '{kernel}' iterates over {expected} grid dimensions but {supplied} were supplied")]
    GridDimensions {
        kernel: String,
        expected: usize,
        supplied: usize,
    },

    /// An argument lacks the capability the parameter needs
    #[error("{op}: argument cannot provide a {capability}")]
    CapabilityMismatch { op: String, capability: Capability },

    /// Structural copy between value descriptions failed
    #[error("cannot convert {from} to {to}: {reason}")]
    TypeConversion { from: String, to: String, reason: String },

    #[error("no entry named '{name}' in the {registry} registry")]
    UnregisteredKernel { registry: String, name: String },

    #[error("'{name}' is already registered in the {registry} registry")]
    DuplicateRegistration { registry: String, name: String },

    /// Translated device or driver failure
    #[error("{op} failed with {status}: {detail}")]
    Backend {
        op: String,
        status: BackendStatus,
        detail: String,
    },

    /// Parameter conversion failure, enriched with where it happened
    #[error(
        "attempting to convert parameter {index} ('{name}') of kernel '{kernel}' from passed type {passed} \
         to required type {required} with abstract type {declared}: {source}"
    )]
    Bind {
        kernel: String,
        index: usize,
        name: String,
        passed: String,
        required: String,
        declared: String,
        #[source]
        source: Box<Error>,
    },

    /// Kernel declaration is inconsistent with itself or its compute function
    #[error("kernel '{kernel}': {reason}")]
    Declaration { kernel: String, reason: String },

    /// Compute function does not fit the declared parameters
    #[error("kernel '{kernel}': compute function signature does not match: {reason}")]
    Signature { kernel: String, reason: String },

    #[error("kernel '{0}' has no compute function")]
    NoComputeFunction(String),

    #[error("unknown value type '{0}'")]
    UnknownType(String),

    #[error("invalid type expression '{expr}': {reason}")]
    InvalidTypeExpression { expr: String, reason: String },

    #[error("expression '{expr}': {reason}")]
    Expression { expr: String, reason: String },

    #[error("{op}: conversion to {target} is not supported")]
    UnsupportedConversion { op: String, target: String },

    #[error("{op}: {what} belongs to context {found}, not {expected}")]
    ForeignContext {
        op: String,
        what: String,
        expected: ContextId,
        found: ContextId,
    },

    #[error("invalid memory region operation: {0}")]
    InvalidRegion(String),
}

/// Flat classification of [`Error`], looking through [`Error::Bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Arity,
    GridDimensions,
    CapabilityMismatch,
    TypeConversion,
    UnregisteredKernel,
    DuplicateRegistration,
    Backend,
    Declaration,
    Signature,
    NoComputeFunction,
    UnknownType,
    InvalidTypeExpression,
    Expression,
    UnsupportedConversion,
    ForeignContext,
    InvalidRegion,
}

impl Error {
    pub fn arity(kernel: impl Into<String>, expected: usize, supplied: usize) -> Self {
        let problem = if supplied < expected {
            ArityProblem::NotEnough
        } else {
            ArityProblem::TooMany
        };
        Self::Arity {
            kernel: kernel.into(),
            problem,
            expected,
            supplied,
        }
    }

    pub fn capability(op: impl Into<String>, capability: Capability) -> Self {
        Self::CapabilityMismatch {
            op: op.into(),
            capability,
        }
    }

    pub fn conversion(from: impl fmt::Display, to: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::TypeConversion {
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.into(),
        }
    }

    pub fn backend(op: impl Into<String>, status: BackendStatus, detail: impl Into<String>) -> Self {
        Self::Backend {
            op: op.into(),
            status,
            detail: detail.into(),
        }
    }

    pub fn declaration(kernel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Declaration {
            kernel: kernel.into(),
            reason: reason.into(),
        }
    }

    pub fn signature(kernel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Signature {
            kernel: kernel.into(),
            reason: reason.into(),
        }
    }

    pub fn expression(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Expression {
            expr: expr.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_region(msg: impl Into<String>) -> Self {
        Self::InvalidRegion(msg.into())
    }

    /// The innermost error, skipping bind-context wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Bind { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root_cause() {
            Error::Arity { .. } => ErrorKind::Arity,
            Error::GridDimensions { .. } => ErrorKind::GridDimensions,
            Error::CapabilityMismatch { .. } => ErrorKind::CapabilityMismatch,
            Error::TypeConversion { .. } => ErrorKind::TypeConversion,
            Error::UnregisteredKernel { .. } => ErrorKind::UnregisteredKernel,
            Error::DuplicateRegistration { .. } => ErrorKind::DuplicateRegistration,
            Error::Backend { .. } => ErrorKind::Backend,
            Error::Declaration { .. } => ErrorKind::Declaration,
            Error::Signature { .. } => ErrorKind::Signature,
            Error::NoComputeFunction(_) => ErrorKind::NoComputeFunction,
            Error::UnknownType(_) => ErrorKind::UnknownType,
            Error::InvalidTypeExpression { .. } => ErrorKind::InvalidTypeExpression,
            Error::Expression { .. } => ErrorKind::Expression,
            Error::UnsupportedConversion { .. } => ErrorKind::UnsupportedConversion,
            Error::ForeignContext { .. } => ErrorKind::ForeignContext,
            Error::InvalidRegion(_) => ErrorKind::InvalidRegion,
            Error::Bind { .. } => unreachable!("root_cause never returns a bind wrapper"),
        }
    }
}
