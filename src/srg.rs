//! The live spatial-relationship graph.
//!
//! The SRG is the global graph of currently-known relationships. Its nodes
//! and edges carry provenance on top of their attributes: which subgraphs
//! spawned them, which subgraphs consume them, and which atomic sensors
//! ("info-sources") their data flows from.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::attributes::AttributeMap;
use crate::error::ValidationError;
use crate::graph::Graph;
use crate::value::AttributeValue;

/// Identifies a node of a repository subgraph, for attribute mirroring.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    /// Id of the subgraph the node belongs to.
    pub subgraph_id: String,
    /// Name of the node within that subgraph.
    pub node_name: String,
}

impl NodeRef {
    /// Creates a node reference.
    #[must_use]
    pub fn new(subgraph_id: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            subgraph_id: subgraph_id.into(),
            node_name: node_name.into(),
        }
    }
}

/// Payload of an SRG node.
///
/// A node may be spawned by several subgraphs; its attributes are the merge
/// of all of them, and `back_refs` records every original subgraph node
/// whose attributes must mirror later merges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SrgNodeData {
    /// Merged attributes from all spawning subgraphs.
    pub attributes: AttributeMap,
    /// Ids of the subgraphs that introduced or merged into this node.
    pub spawners: BTreeSet<String>,
    /// Repository nodes bound to this SRG node.
    pub back_refs: BTreeSet<NodeRef>,
}

/// Payload of an SRG edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SrgEdgeData {
    /// Edge attributes.
    pub attributes: AttributeMap,
    /// Id of the sole subgraph owning this edge.
    pub subgraph_id: String,
    /// Name of the edge within its owning subgraph.
    pub local_name: String,
    /// Name of the spawning pattern; empty for base-fact edges.
    pub pattern_name: String,
    /// The atomic sensors whose data flows into this edge. For base-fact
    /// edges this is exactly the edge's own unique name.
    pub info_sources: BTreeSet<String>,
    /// Ids of the subgraphs that consumed this edge as an input.
    pub dependants: BTreeSet<String>,
}

/// The global graph of known relationships.
#[derive(Debug, Clone, Default)]
pub struct Srg {
    graph: Graph<SrgNodeData, SrgEdgeData>,
}

impl Srg {
    /// Creates an empty SRG.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access to the underlying graph.
    #[must_use]
    pub fn graph(&self) -> &Graph<SrgNodeData, SrgEdgeData> {
        &self.graph
    }

    /// Returns true if a node with this id exists.
    #[must_use]
    pub fn has_node(&self, id: &str) -> bool {
        self.graph.has_node(id)
    }

    /// Returns true if an edge with this name exists.
    #[must_use]
    pub fn has_edge(&self, name: &str) -> bool {
        self.graph.has_edge(name)
    }

    /// Registers a new node under a globally unique id.
    ///
    /// The node's `id` attribute is set from the id when absent, so
    /// predicates of the form `id == '...'` can match it.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateSrgNode`] if the id is taken.
    pub fn add_node(
        &mut self,
        id: &str,
        attributes: AttributeMap,
        spawner: &str,
        back_ref: NodeRef,
    ) -> Result<(), ValidationError> {
        if self.graph.has_node(id) {
            return Err(ValidationError::DuplicateSrgNode { id: id.to_string() });
        }

        let mut data = SrgNodeData {
            attributes,
            spawners: BTreeSet::new(),
            back_refs: BTreeSet::new(),
        };
        if !data.attributes.has("id") {
            data.attributes.set("id", AttributeValue::text(id));
        }
        if !spawner.is_empty() {
            data.spawners.insert(spawner.to_string());
        }
        data.back_refs.insert(back_ref);

        self.graph
            .add_node(id, data)
            .map_err(|_| ValidationError::DuplicateSrgNode { id: id.to_string() })
    }

    /// Merges a spawning subgraph's node into an existing SRG node.
    ///
    /// Returns the merged attribute set and the back-references that were
    /// present *before* this merge; the caller mirrors the merged
    /// attributes into those repository nodes. The new back-reference is
    /// recorded after the snapshot so the arriving node does not receive
    /// its own attributes back.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NodeNotFound`] if no node has this id.
    pub fn merge_node(
        &mut self,
        id: &str,
        attributes: &AttributeMap,
        spawner: &str,
        back_ref: NodeRef,
    ) -> Result<(AttributeMap, Vec<NodeRef>), ValidationError> {
        let node = self.graph.node_mut(id)?;
        node.data.spawners.insert(spawner.to_string());
        node.data.attributes.merge(attributes);

        let mirror_targets: Vec<NodeRef> = node.data.back_refs.iter().cloned().collect();
        let merged = node.data.attributes.clone();
        node.data.back_refs.insert(back_ref);

        trace!(id, spawner, "merged node attributes");
        Ok((merged, mirror_targets))
    }

    /// Removes a node and all incident edges.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NodeNotFound`] if absent.
    pub fn remove_node(&mut self, id: &str) -> Result<(), ValidationError> {
        self.graph.remove_node(id)
    }

    /// Inserts an edge between two registered nodes.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateEdge`] or
    /// [`ValidationError::NodeNotFound`].
    pub fn add_edge(
        &mut self,
        name: &str,
        source: &str,
        target: &str,
        data: SrgEdgeData,
    ) -> Result<(), ValidationError> {
        self.graph.add_edge(name, source, target, data)
    }

    /// Removes an edge.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EdgeNotFound`] if absent.
    pub fn remove_edge(&mut self, name: &str) -> Result<(), ValidationError> {
        self.graph.remove_edge(name)
    }

    /// Mutable access to an edge's payload.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EdgeNotFound`] if absent.
    pub fn edge_data_mut(&mut self, name: &str) -> Result<&mut SrgEdgeData, ValidationError> {
        Ok(&mut self.graph.edge_mut(name)?.data)
    }

    /// Mutable access to a node's payload.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NodeNotFound`] if absent.
    pub fn node_data_mut(&mut self, id: &str) -> Result<&mut SrgNodeData, ValidationError> {
        Ok(&mut self.graph.node_mut(id)?.data)
    }
}
