//! Attribute expressions and predicates.
//!
//! Patterns attach two kinds of small evaluable trees to their nodes and
//! edges: *predicates*, boolean conditions that gate whether an SRG object
//! is an acceptable match, and *attribute expressions*, which compute
//! attribute values for derived output objects. Both evaluate in an
//! [`EvaluationContext`], either local (one object) or global (a whole
//! match).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::context::EvaluationContext;
use crate::error::EvalError;
use crate::value::AttributeValue;

/// A unary arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
}

/// A binary arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Exponentiation.
    Pow,
}

/// A function callable from an attribute expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Function {
    /// Square root of a number.
    Sqrt,
    /// Minimum of two numbers.
    Min,
    /// Maximum of two numbers.
    Max,
    /// Error of synchronizing a pull input with a reference input.
    SyncError,
    /// Steady-state accuracy of a two-state Kalman model.
    SteadyState,
    /// Number of info-sources, optionally restricted to a prefix.
    SourceCount,
    /// A function resolved through a caller-supplied registry.
    #[serde(untagged)]
    Custom(String),
}

impl Function {
    fn name(&self) -> &str {
        match self {
            Self::Sqrt => "sqrt",
            Self::Min => "min",
            Self::Max => "max",
            Self::SyncError => "syncError",
            Self::SteadyState => "steadyState",
            Self::SourceCount => "sourceCount",
            Self::Custom(name) => name,
        }
    }
}

/// A tree of operations computing one attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// A constant value.
    Const(AttributeValue),
    /// A reference to an attribute, optionally qualified by an object name.
    ///
    /// Without a qualifier the reference binds to the enclosing node/edge
    /// in a local context. In a global context the qualifier is required
    /// and resolves through the match's input-object table.
    Attribute {
        /// Object the attribute belongs to (`edge.latency` → `edge`).
        object: Option<String>,
        /// The attribute name.
        name: String,
    },
    /// A unary arithmetic operation.
    Unary(UnaryOp, Box<Expr>),
    /// A binary arithmetic operation.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// A function call.
    Function(Function, Vec<Expr>),
}

impl Expr {
    /// Creates a constant expression from anything convertible to a value.
    #[must_use]
    pub fn constant(v: impl Into<AttributeValue>) -> Self {
        Self::Const(v.into())
    }

    /// Creates an unqualified attribute reference.
    #[must_use]
    pub fn attr(name: impl Into<String>) -> Self {
        Self::Attribute {
            object: None,
            name: name.into(),
        }
    }

    /// Creates an object-qualified attribute reference.
    #[must_use]
    pub fn object_attr(object: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Attribute {
            object: Some(object.into()),
            name: name.into(),
        }
    }

    /// Evaluates the expression in the supplied context.
    ///
    /// # Errors
    ///
    /// Returns an [`EvalError`] for non-numeric operands of arithmetic,
    /// wrong arities, unknown functions, context violations, or missing
    /// capabilities. Callers at the match/expansion boundary drop the
    /// offending attribute or match instead of propagating.
    pub fn eval(&self, ctx: &EvaluationContext<'_>) -> Result<AttributeValue, EvalError> {
        match self {
            Self::Const(v) => Ok(v.clone()),
            Self::Attribute { object, name } => eval_attribute(ctx, object.as_deref(), name),
            Self::Unary(op, child) => {
                let v = child.eval(ctx)?.as_number()?;
                Ok(AttributeValue::number(match op {
                    UnaryOp::Neg => -v,
                }))
            }
            Self::Binary(op, lhs, rhs) => {
                let a = lhs.eval(ctx)?.as_number()?;
                let b = rhs.eval(ctx)?.as_number()?;
                Ok(AttributeValue::number(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                }))
            }
            Self::Function(f, args) => eval_function(ctx, f, args),
        }
    }
}

fn eval_attribute(
    ctx: &EvaluationContext<'_>,
    object: Option<&str>,
    name: &str,
) -> Result<AttributeValue, EvalError> {
    if let Some(attrs) = ctx.local_attributes() {
        return Ok(attrs.get(name).cloned().unwrap_or_default());
    }

    // Global context: the reference must name an input object of the match.
    let Some(object) = object else {
        return Err(EvalError::UnresolvedObject {
            object: String::new(),
        });
    };
    match ctx.object_attributes(object) {
        Some(attrs) => Ok(attrs.get(name).cloned().unwrap_or_default()),
        // Unbound object: the reference silently yields nothing.
        None => Ok(AttributeValue::empty()),
    }
}

fn eval_function(
    ctx: &EvaluationContext<'_>,
    f: &Function,
    args: &[Expr],
) -> Result<AttributeValue, EvalError> {
    match f {
        Function::Sqrt => {
            expect_arity(f, args, 1)?;
            Ok(AttributeValue::number(args[0].eval(ctx)?.as_number()?.sqrt()))
        }
        Function::Min => {
            expect_arity(f, args, 2)?;
            let a = args[0].eval(ctx)?.as_number()?;
            let b = args[1].eval(ctx)?.as_number()?;
            Ok(AttributeValue::number(a.min(b)))
        }
        Function::Max => {
            expect_arity(f, args, 2)?;
            let a = args[0].eval(ctx)?.as_number()?;
            let b = args[1].eval(ctx)?.as_number()?;
            Ok(AttributeValue::number(a.max(b)))
        }
        Function::SyncError => sync_error(ctx, f, args),
        Function::SteadyState => {
            if args.len() < 4 || (args.len() - 1) % 3 != 0 {
                return Err(EvalError::WrongArity {
                    function: f.name().to_string(),
                    got: args.len(),
                });
            }
            Err(EvalError::CapabilityUnavailable {
                function: f.name().to_string(),
                reason: "requires an eigen-decomposition backend".to_string(),
            })
        }
        Function::SourceCount => source_count(ctx, f, args),
        Function::Custom(name) => {
            let Some(hook) = ctx.custom_function(name) else {
                return Err(EvalError::UnknownFunction { name: name.clone() });
            };
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(arg.eval(ctx)?);
            }
            hook(&values)
        }
    }
}

/// Error of synchronizing a pull input with a reference input, given a
/// motion model `q`: the pull edge's update interval spreads its samples
/// over the reference timeline.
fn sync_error(
    ctx: &EvaluationContext<'_>,
    f: &Function,
    args: &[Expr],
) -> Result<AttributeValue, EvalError> {
    expect_arity(f, args, 3)?;
    if !ctx.is_global() {
        return Err(EvalError::GlobalRequired {
            function: f.name().to_string(),
        });
    }

    let q = args[0].eval(ctx)?.as_number()?;
    let pull_edge = args[1].eval(ctx)?.as_text();
    let ref_edge = args[2].eval(ctx)?.as_text();

    let pull = ctx
        .object_attributes(&pull_edge)
        .ok_or_else(|| EvalError::UnresolvedObject {
            object: pull_edge.clone(),
        })?;
    let reference = ctx
        .object_attributes(&ref_edge)
        .ok_or_else(|| EvalError::UnresolvedObject {
            object: ref_edge.clone(),
        })?;

    let update_time = required_number(pull, "updateTime")?;
    let pull_latency = required_number(pull, "latency")?;
    let ref_latency = required_number(reference, "latency")?;

    // The limit for update_time -> 0 is 0.
    let result = if update_time < 1e-10 {
        0.0
    } else {
        let t1 = (pull_latency - ref_latency + update_time).max(0.0);
        let t2 = (pull_latency - ref_latency).max(0.0);
        q / (12.0 * update_time) * (t1.powi(4) - t2.powi(4))
    };

    Ok(AttributeValue::number(result))
}

fn source_count(
    ctx: &EvaluationContext<'_>,
    f: &Function,
    args: &[Expr],
) -> Result<AttributeValue, EvalError> {
    if args.len() > 1 {
        return Err(EvalError::WrongArity {
            function: f.name().to_string(),
            got: args.len(),
        });
    }

    static EMPTY: BTreeSet<String> = BTreeSet::new();
    let sources = if ctx.is_global() {
        ctx.match_info_sources().unwrap_or(&EMPTY)
    } else {
        ctx.local_info_sources().unwrap_or(&EMPTY)
    };

    #[allow(clippy::cast_precision_loss)]
    let count = match args.first() {
        None => sources.len() as f64,
        Some(arg) => {
            let prefix = arg.eval(ctx)?.as_text();
            count_prefixed(sources, &prefix) as f64
        }
    };
    Ok(AttributeValue::number(count))
}

fn required_number(attrs: &crate::attributes::AttributeMap, key: &str) -> Result<f64, EvalError> {
    attrs
        .get(key)
        .ok_or_else(|| EvalError::NotANumber {
            text: format!("<missing {key}>"),
        })?
        .as_number()
}

fn expect_arity(f: &Function, args: &[Expr], n: usize) -> Result<(), EvalError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(EvalError::WrongArity {
            function: f.name().to_string(),
            got: args.len(),
        })
    }
}

fn count_prefixed(sources: &BTreeSet<String>, prefix: &str) -> usize {
    sources.iter().filter(|s| s.starts_with(prefix)).count()
}

/// A comparison operator in a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

/// A predicate function, beyond plain comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PredFunction {
    /// True iff the object's info-source set contains an element with the
    /// given prefix. Local contexts only.
    InSourceSet,
}

/// A boolean condition over attribute values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pred {
    /// Negation.
    Not(Box<Pred>),
    /// Conjunction.
    And(Box<Pred>, Box<Pred>),
    /// Disjunction.
    Or(Box<Pred>, Box<Pred>),
    /// Comparison of two expressions.
    Compare(CmpOp, Expr, Expr),
    /// A predicate function applied to expressions.
    Function(PredFunction, Vec<Expr>),
}

impl Pred {
    /// Convenience: `attribute == "constant"`.
    #[must_use]
    pub fn attr_equals(name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::Compare(CmpOp::Eq, Expr::attr(name), Expr::Const(value.into()))
    }

    /// Evaluates the predicate in the supplied context.
    ///
    /// # Errors
    ///
    /// Propagates [`EvalError`]s from sub-expressions. During match
    /// compatibility checks an error counts as "incompatible".
    pub fn eval(&self, ctx: &EvaluationContext<'_>) -> Result<bool, EvalError> {
        match self {
            Self::Not(child) => Ok(!child.eval(ctx)?),
            Self::And(lhs, rhs) => Ok(lhs.eval(ctx)? && rhs.eval(ctx)?),
            Self::Or(lhs, rhs) => Ok(lhs.eval(ctx)? || rhs.eval(ctx)?),
            Self::Compare(op, lhs, rhs) => compare(*op, &lhs.eval(ctx)?, &rhs.eval(ctx)?),
            Self::Function(PredFunction::InSourceSet, args) => in_source_set(ctx, args),
        }
    }

    /// Returns the `(attribute, constant)` pairs any satisfying attribute
    /// set must carry. Used as a pattern-compilation hint: only
    /// conjunctions of `attribute == constant` contribute.
    #[must_use]
    pub fn conjunctive_equalities(&self) -> Vec<(String, String)> {
        match self {
            Self::And(lhs, rhs) => {
                let mut pairs = lhs.conjunctive_equalities();
                pairs.extend(rhs.conjunctive_equalities());
                pairs
            }
            Self::Compare(CmpOp::Eq, Expr::Attribute { name, .. }, Expr::Const(v)) => {
                vec![(name.clone(), v.as_text())]
            }
            _ => Vec::new(),
        }
    }
}

fn compare(op: CmpOp, a: &AttributeValue, b: &AttributeValue) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(if a.is_number() {
            b.is_number() && a.as_number()? == b.as_number()?
        } else {
            a.as_text() == b.as_text()
        }),
        CmpOp::Ne => Ok(if a.is_number() {
            !b.is_number() || a.as_number()? != b.as_number()?
        } else {
            a.as_text() != b.as_text()
        }),
        CmpOp::Gt => Ok(a.as_number()? > b.as_number()?),
        CmpOp::Ge => Ok(a.as_number()? >= b.as_number()?),
        CmpOp::Lt => Ok(a.as_number()? < b.as_number()?),
        CmpOp::Le => Ok(a.as_number()? <= b.as_number()?),
    }
}

fn in_source_set(ctx: &EvaluationContext<'_>, args: &[Expr]) -> Result<bool, EvalError> {
    if args.len() != 1 {
        return Err(EvalError::WrongArity {
            function: "inSourceSet".to_string(),
            got: args.len(),
        });
    }
    if ctx.is_global() {
        return Err(EvalError::GlobalNotAllowed {
            function: "inSourceSet".to_string(),
        });
    }

    let prefix = args[0].eval(ctx)?.as_text();
    static EMPTY: BTreeSet<String> = BTreeSet::new();
    let sources = ctx.local_info_sources().unwrap_or(&EMPTY);
    Ok(sources.iter().any(|s| s.starts_with(&prefix)))
}
