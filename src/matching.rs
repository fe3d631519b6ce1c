//! A partial or complete isomorphism between a pattern and the SRG.
//!
//! The matcher grows a [`Matching`] step by step: forward and backward
//! dictionaries between pattern objects and SRG objects, plus the derived
//! bookkeeping computed once a match is complete (the union of
//! info-sources, the expanded output attributes, and the table of input
//! objects used by global-context evaluation).

use std::collections::{BTreeMap, BTreeSet};

use crate::attributes::AttributeMap;

/// A reference to an SRG object, by node id or edge name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SrgRef {
    /// An SRG node, by id.
    Node(String),
    /// An SRG edge, by its SRG-global name.
    Edge(String),
}

/// The state of one pattern-to-SRG match.
#[derive(Debug, Clone, Default)]
pub struct Matching {
    node_forward: BTreeMap<String, String>,
    node_backward: BTreeMap<String, String>,
    edge_forward: BTreeMap<String, String>,
    edge_backward: BTreeMap<String, String>,

    /// Index of the next search-plan step to execute.
    pub(crate) step: usize,

    /// Union of the info-sources of all matched input edges.
    pub info_sources: BTreeSet<String>,
    /// Expanded attributes of the pattern's output nodes, by node name.
    pub expanded_node_attributes: BTreeMap<String, AttributeMap>,
    /// Expanded attributes of the pattern's output edges, by edge name.
    pub expanded_edge_attributes: BTreeMap<String, AttributeMap>,
    /// Input objects of the pattern, resolved to SRG objects. Required by
    /// global-context predicates and attribute expressions.
    pub input_objects: BTreeMap<String, SrgRef>,
}

impl Matching {
    /// Creates an empty matching positioned at the first plan step.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a pattern node to an SRG node.
    pub fn bind_node(&mut self, pattern_node: &str, srg_node: &str) {
        self.node_forward
            .insert(pattern_node.to_string(), srg_node.to_string());
        self.node_backward
            .insert(srg_node.to_string(), pattern_node.to_string());
    }

    /// Binds a pattern edge to an SRG edge, binding both endpoint pairs.
    pub fn bind_edge(
        &mut self,
        pattern_edge: &str,
        pattern_source: &str,
        pattern_target: &str,
        srg_edge: &str,
        srg_source: &str,
        srg_target: &str,
    ) {
        self.edge_forward
            .insert(pattern_edge.to_string(), srg_edge.to_string());
        self.edge_backward
            .insert(srg_edge.to_string(), pattern_edge.to_string());
        self.bind_node(pattern_source, srg_source);
        self.bind_node(pattern_target, srg_target);
    }

    /// Returns true if the pattern node is bound.
    #[must_use]
    pub fn is_pattern_node_bound(&self, pattern_node: &str) -> bool {
        self.node_forward.contains_key(pattern_node)
    }

    /// Returns true if the SRG node is used by this matching.
    #[must_use]
    pub fn is_srg_node_bound(&self, srg_node: &str) -> bool {
        self.node_backward.contains_key(srg_node)
    }

    /// Returns true if the pattern edge is bound.
    #[must_use]
    pub fn is_pattern_edge_bound(&self, pattern_edge: &str) -> bool {
        self.edge_forward.contains_key(pattern_edge)
    }

    /// Returns true if the SRG edge is used by this matching.
    #[must_use]
    pub fn is_srg_edge_bound(&self, srg_edge: &str) -> bool {
        self.edge_backward.contains_key(srg_edge)
    }

    /// The SRG node a pattern node is bound to, if any.
    #[must_use]
    pub fn srg_node_for(&self, pattern_node: &str) -> Option<&str> {
        self.node_forward.get(pattern_node).map(String::as_str)
    }

    /// The SRG edge a pattern edge is bound to, if any.
    #[must_use]
    pub fn srg_edge_for(&self, pattern_edge: &str) -> Option<&str> {
        self.edge_forward.get(pattern_edge).map(String::as_str)
    }

    /// The pattern node an SRG node is bound to, if any.
    #[must_use]
    pub fn pattern_node_for(&self, srg_node: &str) -> Option<&str> {
        self.node_backward.get(srg_node).map(String::as_str)
    }

    /// The pattern edge an SRG edge is bound to, if any.
    #[must_use]
    pub fn pattern_edge_for(&self, srg_edge: &str) -> Option<&str> {
        self.edge_backward.get(srg_edge).map(String::as_str)
    }

    /// Number of bound edges.
    #[must_use]
    pub fn bound_edge_count(&self) -> usize {
        self.edge_forward.len()
    }

    /// Iterates `(pattern edge, SRG edge)` bindings in pattern-edge order.
    pub fn edge_bindings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.edge_forward
            .iter()
            .map(|(p, s)| (p.as_str(), s.as_str()))
    }

    /// Iterates `(pattern node, SRG node)` bindings in pattern-node order.
    pub fn node_bindings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.node_forward
            .iter()
            .map(|(p, s)| (p.as_str(), s.as_str()))
    }

    /// Clears all derived bookkeeping before (re-)expansion.
    pub fn clear_expansion(&mut self) {
        self.info_sources.clear();
        self.expanded_node_attributes.clear();
        self.expanded_edge_attributes.clear();
        self.input_objects.clear();
    }
}
