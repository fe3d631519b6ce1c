//! The subgraph data model shared by base facts, patterns and queries.
//!
//! A subgraph is one directed graph whose nodes and edges are each tagged
//! as belonging to the *input* or *output* section. The combination of
//! sections present classifies an announcement: output only is a base
//! fact, both is a pattern, input only is a query, neither is a deletion
//! marker.

use serde::{Deserialize, Serialize};

use crate::attributes::AttributeMap;
use crate::error::ValidationError;
use crate::expr::{Expr, Pred};
use crate::graph::{Edge, Graph, Node};
use crate::value::AttributeValue;

/// Section tag: every node and edge of a subgraph is input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InOut {
    /// Input section: to be matched against the SRG.
    Input,
    /// Output section: what the subgraph produces.
    Output,
}

/// A reference identifying an SRG edge by owning subgraph and local name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeRef {
    /// Id of the subgraph owning the referenced edge.
    pub subgraph_id: String,
    /// Name of the edge within that subgraph.
    pub edge_name: String,
}

impl EdgeRef {
    /// Creates an edge reference.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::IllegalEdgeReference`] if either part is
    /// empty.
    pub fn new(
        subgraph_id: impl Into<String>,
        edge_name: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let subgraph_id = subgraph_id.into();
        let edge_name = edge_name.into();
        if subgraph_id.is_empty() || edge_name.is_empty() {
            return Err(ValidationError::IllegalEdgeReference {
                subgraph_id,
                edge_name,
            });
        }
        Ok(Self {
            subgraph_id,
            edge_name,
        })
    }

    /// The SRG-global name of the referenced edge.
    #[must_use]
    pub fn srg_edge_name(&self) -> String {
        format!("{}:{}", self.subgraph_id, self.edge_name)
    }
}

impl std::fmt::Display for EdgeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.subgraph_id, self.edge_name)
    }
}

/// Payload of a subgraph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphNode {
    /// Which section the node belongs to.
    pub tag: InOut,
    /// The globally unique id once the node is bound to the SRG. Empty for
    /// nodes that are not (yet) bound.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub qualified_name: String,
    /// Static attributes.
    pub attributes: AttributeMap,
    /// Predicates an SRG node must satisfy to match this node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predicates: Vec<Pred>,
    /// Attribute-expression rules `name -> expression`, evaluated on a
    /// complete match for output objects.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expressions: Vec<(String, Expr)>,
}

impl SubgraphNode {
    /// Creates a node payload with the given section tag.
    #[must_use]
    pub fn new(tag: InOut) -> Self {
        Self {
            tag,
            qualified_name: String::new(),
            attributes: AttributeMap::new(),
            predicates: Vec::new(),
            expressions: Vec::new(),
        }
    }

    /// Creates an input node payload.
    #[must_use]
    pub fn input() -> Self {
        Self::new(InOut::Input)
    }

    /// Creates an output node payload.
    #[must_use]
    pub fn output() -> Self {
        Self::new(InOut::Output)
    }

    /// Sets the qualified name.
    #[must_use]
    pub fn with_qualified_name(mut self, id: impl Into<String>) -> Self {
        self.qualified_name = id.into();
        self
    }

    /// Adds a static attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.set(key, value.into());
        self
    }

    /// Adds a predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Pred) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Adds an attribute-expression rule.
    #[must_use]
    pub fn with_expression(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.expressions.push((name.into(), expr));
        self
    }

    /// Returns true if the node belongs to the input section.
    #[must_use]
    pub fn is_input(&self) -> bool {
        self.tag == InOut::Input
    }

    /// Returns true if the node belongs to the output section.
    #[must_use]
    pub fn is_output(&self) -> bool {
        self.tag == InOut::Output
    }
}

/// Payload of a subgraph edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphEdge {
    /// Which section the edge belongs to.
    pub tag: InOut,
    /// Static attributes.
    pub attributes: AttributeMap,
    /// Predicates an SRG edge must satisfy to match this edge.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predicates: Vec<Pred>,
    /// Attribute-expression rules `name -> expression`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expressions: Vec<(String, Expr)>,
    /// For input edges of instantiated subgraphs: the SRG edge this edge
    /// was bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_ref: Option<EdgeRef>,
}

impl SubgraphEdge {
    /// Creates an edge payload with the given section tag.
    #[must_use]
    pub fn new(tag: InOut) -> Self {
        Self {
            tag,
            attributes: AttributeMap::new(),
            predicates: Vec::new(),
            expressions: Vec::new(),
            edge_ref: None,
        }
    }

    /// Creates an input edge payload.
    #[must_use]
    pub fn input() -> Self {
        Self::new(InOut::Input)
    }

    /// Creates an output edge payload.
    #[must_use]
    pub fn output() -> Self {
        Self::new(InOut::Output)
    }

    /// Adds a static attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.set(key, value.into());
        self
    }

    /// Adds a predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Pred) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Adds an attribute-expression rule.
    #[must_use]
    pub fn with_expression(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.expressions.push((name.into(), expr));
        self
    }

    /// Sets the edge reference.
    #[must_use]
    pub fn with_edge_ref(mut self, edge_ref: EdgeRef) -> Self {
        self.edge_ref = Some(edge_ref);
        self
    }

    /// Returns true if the edge belongs to the input section.
    #[must_use]
    pub fn is_input(&self) -> bool {
        self.tag == InOut::Input
    }

    /// Returns true if the edge belongs to the output section.
    #[must_use]
    pub fn is_output(&self) -> bool {
        self.tag == InOut::Output
    }
}

/// How an announced subgraph is to be interpreted, derived from which
/// sections it populates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnouncementKind {
    /// Output only: a base fact to merge into the SRG.
    SrgRegistration,
    /// Input and output: a deductive rule.
    Pattern,
    /// Input only: a request for relationships.
    Query,
    /// Neither: deletion of a previous announcement.
    Deletion,
}

/// A subgraph: one graph of tagged nodes and edges plus pattern-level
/// metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subgraph {
    /// Unique id of the subgraph (assigned by the announcing client or
    /// generated at instantiation).
    pub id: String,
    /// Human-readable pattern/query name.
    pub name: String,
    /// The tagged graph.
    pub graph: Graph<SubgraphNode, SubgraphEdge>,
    /// Opaque dataflow configuration, passed through verbatim.
    #[serde(default, skip_serializing_if = "AttributeValue::is_empty")]
    pub dataflow_configuration: AttributeValue,
    /// Dataflow attributes, passed through verbatim.
    #[serde(default, skip_serializing_if = "AttributeMap::is_empty")]
    pub dataflow_attributes: AttributeMap,
    /// Expression minimized to select the best match, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_match_expression: Option<Expr>,
    /// Keep only the best match per query instead of all matches.
    #[serde(default)]
    pub only_best_edge_match: bool,
}

impl Subgraph {
    /// Creates an empty subgraph with the given id and name.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            graph: Graph::new(),
            dataflow_configuration: AttributeValue::empty(),
            dataflow_attributes: AttributeMap::new(),
            best_match_expression: None,
            only_best_edge_match: false,
        }
    }

    /// Creates the deletion marker for a previously issued subgraph: an
    /// otherwise empty subgraph whose id names the instance to delete.
    #[must_use]
    pub fn deletion_marker(id: impl Into<String>) -> Self {
        let id = id.into();
        let name = id.clone();
        Self::new(id, name)
    }

    /// Adds a node. See [`Graph::add_node`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateNode`] if the name is in use.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        data: SubgraphNode,
    ) -> Result<(), ValidationError> {
        self.graph.add_node(name, data)
    }

    /// Adds an edge. See [`Graph::add_edge`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateEdge`] or
    /// [`ValidationError::NodeNotFound`].
    pub fn add_edge(
        &mut self,
        name: impl Into<String>,
        source: &str,
        target: &str,
        data: SubgraphEdge,
    ) -> Result<(), ValidationError> {
        self.graph.add_edge(name, source, target, data)
    }

    /// Iterates input edges in name order.
    pub fn input_edges(&self) -> impl Iterator<Item = &Edge<SubgraphEdge>> {
        self.graph.edges().filter(|e| e.data.is_input())
    }

    /// Iterates output edges in name order.
    pub fn output_edges(&self) -> impl Iterator<Item = &Edge<SubgraphEdge>> {
        self.graph.edges().filter(|e| e.data.is_output())
    }

    /// Iterates input nodes in name order.
    pub fn input_nodes(&self) -> impl Iterator<Item = &Node<SubgraphNode>> {
        self.graph.nodes().filter(|n| n.data.is_input())
    }

    /// Iterates output nodes in name order.
    pub fn output_nodes(&self) -> impl Iterator<Item = &Node<SubgraphNode>> {
        self.graph.nodes().filter(|n| n.data.is_output())
    }

    /// Number of output edges.
    #[must_use]
    pub fn output_edge_count(&self) -> usize {
        self.output_edges().count()
    }

    /// Classifies this subgraph as an announcement.
    #[must_use]
    pub fn kind(&self) -> AnnouncementKind {
        let mut has_input = false;
        let mut has_output = false;

        for node in self.graph.nodes() {
            match node.data.tag {
                InOut::Input => has_input = true,
                InOut::Output => has_output = true,
            }
        }
        for edge in self.graph.edges() {
            match edge.data.tag {
                InOut::Input => has_input = true,
                InOut::Output => has_output = true,
            }
        }

        match (has_input, has_output) {
            (false, true) => AnnouncementKind::SrgRegistration,
            (true, true) => AnnouncementKind::Pattern,
            (true, false) => AnnouncementKind::Query,
            (false, false) => AnnouncementKind::Deletion,
        }
    }
}

/// A per-client document: the list of subgraphs a client must start,
/// reconfigure, or (via deletion markers) stop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// The subgraphs, in emission order.
    pub subgraphs: Vec<Subgraph>,
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a subgraph.
    pub fn add_subgraph(&mut self, subgraph: Subgraph) {
        self.subgraphs.push(subgraph);
    }

    /// Returns true if the document carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subgraphs.is_empty()
    }
}
