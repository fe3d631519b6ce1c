//! # srql - the resolver core of a distributed sensor-fusion middleware
//!
//! Clients announce three kinds of things: *base facts* (known
//! spatial/temporal relationships), *patterns* (rules deriving new
//! relationships from existing ones), and *queries* (descriptions of
//! desired relationships). The resolver maintains a live
//! spatial-relationship graph (SRG), repeatedly applies patterns to derive
//! new relationships, answers queries with concrete pattern matches, and
//! emits per-client incremental dataflow plans.
//!
//! ## Core concepts
//!
//! - **Subgraph**: one graph whose nodes and edges are tagged input or
//!   output; the common form of base facts, patterns and queries
//! - **SRG**: the global graph of currently-known relationships, with
//!   full provenance on every node and edge
//! - **Pattern matching**: a compiled search plan enumerated against the
//!   SRG by backtracking
//! - **Resolver**: the two-stage apply decision, query answering, and
//!   transitive deletion
//! - **Server**: announcement routing, fixed-point iteration, per-client
//!   deltas
//!
//! ## Usage
//!
//! ```rust
//! use srql::{Pred, Server, Subgraph, SubgraphEdge, SubgraphNode};
//!
//! let mut server = Server::default();
//!
//! // A sensor driver announces a base fact: a pose edge between two
//! // known entities.
//! let mut base = Subgraph::new("tracker1", "art-tracker");
//! base.add_node("W", SubgraphNode::output().with_qualified_name("World"))?;
//! base.add_node("B", SubgraphNode::output().with_qualified_name("Body"))?;
//! base.add_edge(
//!     "pose",
//!     "W",
//!     "B",
//!     SubgraphEdge::output()
//!         .with_attribute("type", "pose")
//!         .with_attribute("latency", 20.0),
//! )?;
//! server.process_announcement(base, "driver-client")?;
//!
//! // An application asks for any pose relationship.
//! let mut query = Subgraph::new("q1", "render-pose");
//! query.add_node("a", SubgraphNode::input())?;
//! query.add_node("b", SubgraphNode::input())?;
//! query.add_edge(
//!     "wanted",
//!     "a",
//!     "b",
//!     SubgraphEdge::input().with_predicate(Pred::attr_equals("type", "pose")),
//! )?;
//! server.process_announcement(query, "app-client")?;
//!
//! let documents = server.generate_documents()?;
//! assert!(!documents["app-client"].is_empty());
//! # Ok::<(), srql::SrqlError>(())
//! ```
//!
//! The resolver is single-threaded and cooperative: all mutation happens
//! under one logical thread, and the caller serialises announcements and
//! response generation around it.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod attributes;
pub mod context;
pub mod error;
pub mod expr;
pub mod graph;
pub mod matching;
pub mod pattern;
pub mod resolver;
pub mod server;
pub mod srg;
pub mod subgraph;
pub mod value;

// Re-export primary types at the crate root for convenience.
pub use attributes::AttributeMap;
pub use context::{EvaluationContext, FunctionRegistry};
pub use error::{EvalError, SrqlError, SrqlResult, ValidationError};
pub use expr::{BinaryOp, CmpOp, Expr, Function, Pred, PredFunction, UnaryOp};
pub use graph::{Edge, Graph, Node};
pub use matching::{Matching, SrgRef};
pub use pattern::{CompiledPattern, PlanStep};
pub use resolver::{
    BestMatchSelection, EdgeRequirements, InstantiatedSubgraph, Merit, QueryResponse, Resolver,
    ResolverConfig, MAX_FIXED_POINT_ROUNDS,
};
pub use server::{Announcement, AnnouncementRepository, Server};
pub use srg::{NodeRef, Srg, SrgEdgeData, SrgNodeData};
pub use subgraph::{
    AnnouncementKind, Document, EdgeRef, InOut, Subgraph, SubgraphEdge, SubgraphNode,
};
pub use value::AttributeValue;
