//! Error types for srql.
//!
//! All errors are strongly typed using thiserror. Validation errors are
//! surfaced at the caller of the mutating operation; evaluation errors only
//! travel to the nearest match or attribute-expansion boundary, where the
//! offending match or attribute is dropped and the resolver tick continues.

use thiserror::Error;

/// Validation errors raised by graph and announcement mutations.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A node with this name already exists in the graph.
    #[error("Node '{name}' is already in the graph")]
    DuplicateNode {
        /// Offending node name.
        name: String,
    },

    /// An edge with this name already exists in the graph.
    #[error("Edge '{name}' is already in the graph")]
    DuplicateEdge {
        /// Offending edge name.
        name: String,
    },

    /// Lookup or removal of a node that does not exist.
    #[error("No such node in graph: {name}")]
    NodeNotFound {
        /// Missing node name.
        name: String,
    },

    /// Lookup or removal of an edge that does not exist.
    #[error("No such edge in graph: {name}")]
    EdgeNotFound {
        /// Missing edge name.
        name: String,
    },

    /// An edge reference must carry both a subgraph id and an edge name.
    #[error("Illegal edge reference: '{subgraph_id}:{edge_name}'")]
    IllegalEdgeReference {
        /// Referenced subgraph id (possibly empty).
        subgraph_id: String,
        /// Referenced edge name (possibly empty).
        edge_name: String,
    },

    /// An SRG node id was registered twice.
    #[error("Trying to register duplicate SRG node id: {id}")]
    DuplicateSrgNode {
        /// Offending node id.
        id: String,
    },

    /// An announcement id was registered twice.
    #[error("Announcement already registered: {id}")]
    DuplicateAnnouncement {
        /// Offending announcement id.
        id: String,
    },

    /// Lookup of an announcement that is not stored.
    #[error("No such announcement: {id}")]
    AnnouncementNotFound {
        /// Missing announcement id.
        id: String,
    },

    /// Deletion of a query that is not registered.
    #[error("No such query '{name}' for client '{client_id}'")]
    QueryNotFound {
        /// Query name.
        name: String,
        /// Owning client.
        client_id: String,
    },

    /// Lookup of announcements for a client with none registered.
    #[error("No announcements registered for client '{client_id}'")]
    ClientNotFound {
        /// Missing client id.
        client_id: String,
    },
}

/// Errors raised while evaluating attribute expressions and predicates.
///
/// These never abort a resolver tick: the match or attribute they concern
/// is discarded at the evaluation boundary.
#[derive(Debug, Error)]
pub enum EvalError {
    /// A value used as an operand of a numeric operation is not a number.
    #[error("Attribute is not a number: '{text}'")]
    NotANumber {
        /// Textual form of the offending value.
        text: String,
    },

    /// A function was called with the wrong number of arguments.
    #[error("Illegal number of arguments for function '{function}': got {got}")]
    WrongArity {
        /// Function name.
        function: String,
        /// Number of arguments supplied.
        got: usize,
    },

    /// A function name is not built in and no hook resolves it.
    #[error("Unknown function: {name}")]
    UnknownFunction {
        /// Unresolved function name.
        name: String,
    },

    /// A function was used in a context it does not support.
    #[error("Function '{function}' cannot be used in a global context")]
    GlobalNotAllowed {
        /// Function name.
        function: String,
    },

    /// A global context is required but a local one was supplied.
    #[error("Function '{function}' can only be used in attribute expressions")]
    GlobalRequired {
        /// Function name.
        function: String,
    },

    /// A global attribute reference named an object the match does not bind.
    #[error("Object '{object}' is not bound in this match")]
    UnresolvedObject {
        /// Unresolved object name.
        object: String,
    },

    /// The function needs a capability this build does not provide.
    #[error("Function '{function}' is unavailable: {reason}")]
    CapabilityUnavailable {
        /// Function name.
        function: String,
        /// Why the capability is missing.
        reason: String,
    },
}

/// Top-level error type for srql operations.
#[derive(Debug, Error)]
pub enum SrqlError {
    /// Input validation failed.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Expression or predicate evaluation failed.
    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    /// Internal invariant violation. Reaching this from valid inputs is a bug.
    #[error("Internal error: {message}")]
    Internal {
        /// Error description.
        message: String,
    },
}

impl SrqlError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an evaluation error.
    #[must_use]
    pub const fn is_eval(&self) -> bool {
        matches!(self, Self::Eval(_))
    }
}

/// Result type alias for srql operations.
pub type SrqlResult<T> = Result<T, SrqlError>;
