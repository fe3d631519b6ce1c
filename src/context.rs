//! Context for the evaluation of attributes and predicates.
//!
//! Predicates and attribute expressions are evaluated either *locally*
//! against one node's or edge's attributes (pattern-to-SRG compatibility
//! checks), or *globally* against a complete pattern match, where attribute
//! references name the pattern's input objects.

use std::collections::{BTreeMap, BTreeSet};

use crate::attributes::AttributeMap;
use crate::error::EvalError;
use crate::matching::{Matching, SrgRef};
use crate::srg::Srg;
use crate::value::AttributeValue;

/// Signature of a caller-supplied evaluation hook for functions the crate
/// does not know about.
pub type CustomFn = Box<dyn Fn(&[AttributeValue]) -> Result<AttributeValue, EvalError> + Send + Sync>;

/// Registry of domain-specific functions, looked up by name when an
/// expression calls a function that is not built in.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, CustomFn>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function under a name, replacing any previous binding.
    pub fn register(&mut self, name: impl Into<String>, f: CustomFn) {
        self.functions.insert(name.into(), f);
    }

    /// Looks up a function by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CustomFn> {
        self.functions.get(name)
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Scope<'a> {
    /// A single node's or edge's attributes, plus that object's
    /// info-sources where it has any (SRG edges do, SRG nodes do not).
    Local {
        attributes: &'a AttributeMap,
        info_sources: Option<&'a BTreeSet<String>>,
    },
    /// A complete pattern match; object references resolve through the
    /// match's input-object table against the SRG.
    Global { matching: &'a Matching, srg: &'a Srg },
}

/// Everything an expression or predicate needs to evaluate.
pub struct EvaluationContext<'a> {
    scope: Scope<'a>,
    functions: Option<&'a FunctionRegistry>,
}

impl<'a> EvaluationContext<'a> {
    /// Builds a local context over one object's attributes.
    #[must_use]
    pub fn local(attributes: &'a AttributeMap) -> Self {
        Self {
            scope: Scope::Local {
                attributes,
                info_sources: None,
            },
            functions: None,
        }
    }

    /// Builds a local context over one object's attributes and its
    /// info-source set.
    #[must_use]
    pub fn local_with_sources(
        attributes: &'a AttributeMap,
        info_sources: &'a BTreeSet<String>,
    ) -> Self {
        Self {
            scope: Scope::Local {
                attributes,
                info_sources: Some(info_sources),
            },
            functions: None,
        }
    }

    /// Builds a global context over a complete match.
    #[must_use]
    pub fn global(matching: &'a Matching, srg: &'a Srg) -> Self {
        Self {
            scope: Scope::Global { matching, srg },
            functions: None,
        }
    }

    /// Attaches a registry of domain-specific functions.
    #[must_use]
    pub fn with_functions(mut self, functions: &'a FunctionRegistry) -> Self {
        self.functions = Some(functions);
        self
    }

    /// Returns true if this is a global (whole-match) context.
    #[must_use]
    pub const fn is_global(&self) -> bool {
        matches!(self.scope, Scope::Global { .. })
    }

    /// The enclosing object's attributes, in local mode.
    #[must_use]
    pub fn local_attributes(&self) -> Option<&'a AttributeMap> {
        match self.scope {
            Scope::Local { attributes, .. } => Some(attributes),
            Scope::Global { .. } => None,
        }
    }

    /// The enclosing object's info-sources, in local mode.
    #[must_use]
    pub fn local_info_sources(&self) -> Option<&'a BTreeSet<String>> {
        match self.scope {
            Scope::Local { info_sources, .. } => info_sources,
            Scope::Global { .. } => None,
        }
    }

    /// Resolves a named input object of the match to its SRG attributes.
    ///
    /// Returns `None` in local mode or when the match does not bind the
    /// object.
    #[must_use]
    pub fn object_attributes(&self, object: &str) -> Option<&'a AttributeMap> {
        match self.scope {
            Scope::Local { .. } => None,
            Scope::Global { matching, srg } => match matching.input_objects.get(object)? {
                SrgRef::Node(id) => srg.graph().node(id).ok().map(|n| &n.data.attributes),
                SrgRef::Edge(name) => srg.graph().edge(name).ok().map(|e| &e.data.attributes),
            },
        }
    }

    /// The info-sources of the whole match, in global mode.
    #[must_use]
    pub fn match_info_sources(&self) -> Option<&'a BTreeSet<String>> {
        match self.scope {
            Scope::Local { .. } => None,
            Scope::Global { matching, .. } => Some(&matching.info_sources),
        }
    }

    /// Looks up a domain-specific function by name.
    #[must_use]
    pub fn custom_function(&self, name: &str) -> Option<&'a CustomFn> {
        self.functions.and_then(|r| r.get(name))
    }
}
