//! Error types for graph validation, value resolution and provider calls.
//!
//! Errors fall into three groups:
//! - validation errors ([`Error::Cycle`], [`Error::UnknownReference`], ...) abort a
//!   run before any provider is invoked
//! - data errors ([`Error::MissingOutput`], [`Error::Interpolation`]) fail a single node
//! - provider errors ([`ProviderError`]) are categorized for retry decisions

use serde::Serialize;
use thiserror::Error;

/// Errors raised by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum Error {
    /// The dependency graph contains a cycle
    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle {
        /// Nodes on the cycle, with the first node repeated at the end
        path: Vec<String>,
    },

    /// A dependency or deferred value points at a node that was never declared
    #[error("'{node}' references unknown node '{target}'")]
    UnknownReference {
        /// Node holding the reference
        node: String,
        /// Id that could not be found
        target: String,
    },

    /// Two declarations share an id
    #[error("duplicate node id '{id}'")]
    DuplicateNode {
        /// The repeated id
        id: String,
    },

    /// A node names a provider that is not registered
    #[error("'{node}' uses unregistered provider '{provider}'")]
    UnknownProvider {
        /// Node (or recorded resource) needing the provider
        node: String,
        /// Provider name
        provider: String,
    },

    /// A deferred value was read before its producer was ready
    #[error("'{node}' read outputs of '{target}' before it was ready")]
    NotReady {
        /// Node being resolved
        node: String,
        /// Producer that is not ready
        target: String,
    },

    /// The producer is ready but did not capture the referenced output
    #[error("'{node}': output '{path}' of '{target}' is missing")]
    MissingOutput {
        /// Node being resolved
        node: String,
        /// Producer node
        target: String,
        /// Output path that could not be found
        path: String,
    },

    /// A structured value cannot be interpolated into a string
    #[error("'{node}': cannot interpolate a {found} into a string")]
    Interpolation {
        /// Node being resolved
        node: String,
        /// JSON type that was found
        found: &'static str,
    },

    /// An output path could not be parsed
    #[error("invalid output path '{path}': {reason}")]
    InvalidPath {
        /// The offending path
        path: String,
        /// What is wrong with it
        reason: String,
    },

    /// A declared input is malformed
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// What is wrong with it
        reason: String,
    },

    /// The state store failed to read or persist a record
    #[error("state store error: {message}")]
    Store {
        /// What failed
        message: String,
    },

    /// The worker pool could not be created
    #[error("failed to create worker pool: {message}")]
    Pool {
        /// Builder error
        message: String,
    },
}

impl Error {
    /// Whether this error is raised by pre-execution validation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Cycle { .. }
                | Self::UnknownReference { .. }
                | Self::DuplicateNode { .. }
                | Self::UnknownProvider { .. }
        )
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by provider adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderError {
    /// Transient failure (network, rate limit, eventual consistency)
    #[error("retryable: {message}")]
    Retryable {
        /// Provider message
        message: String,
    },

    /// The call exceeded its deadline
    #[error("timed out: {message}")]
    Timeout {
        /// Provider message
        message: String,
    },

    /// Unrecoverable failure (invalid credentials, conflicting state)
    #[error("fatal: {message}")]
    Fatal {
        /// Provider message
        message: String,
    },
}

impl ProviderError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Whether the scheduler should retry the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. } | Self::Timeout { .. })
    }

    /// The provider message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable { message } | Self::Timeout { message } | Self::Fatal { message } => {
                message
            }
        }
    }
}

/// Why a node did not reach `ready`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    /// The provider returned a fatal error
    #[error("{error}")]
    Provider {
        /// Provider error
        error: ProviderError,
    },

    /// Every attempt failed with a retryable error
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last: ProviderError,
    },

    /// The run was cancelled while the node was retrying
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made before cancellation
        attempts: u32,
    },

    /// Inputs could not be resolved
    #[error("{error}")]
    Resolution {
        /// Resolver error
        error: Error,
    },

    /// The change requires replacing a protected resource
    #[error("change requires replacing protected resource")]
    ProtectedReplace,

    /// Deleting the old instance first would strand a dependent that stays
    #[error("cannot replace before dependent '{dependent}' is deleted")]
    DependentRetained {
        /// Dependent still using the old instance
        dependent: String,
    },

    /// Reading or writing the state store failed
    #[error("{error}")]
    Store {
        /// Store error
        error: Error,
    },

    /// A dependency failed, so this node was never attempted
    #[error("dependency '{upstream}' failed")]
    Dependency {
        /// First failed dependency
        upstream: String,
    },

    /// The provider adapter panicked
    #[error("provider panicked: {message}")]
    Panicked {
        /// Panic payload
        message: String,
    },
}

/// A structured per-node failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{node}: {cause}")]
pub struct NodeFailure {
    /// Node id
    pub node: String,
    /// Underlying cause
    pub cause: FailureCause,
    /// Provider attempts made, zero when the provider was never called
    pub attempts: u32,
}

impl NodeFailure {
    pub fn new(node: impl Into<String>, cause: FailureCause) -> Self {
        Self {
            node: node.into(),
            cause,
            attempts: 0,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Whether the failure originated in this node rather than upstream.
    pub fn is_direct(&self) -> bool {
        !matches!(self.cause, FailureCause::Dependency { .. })
    }
}
