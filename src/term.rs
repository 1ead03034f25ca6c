//! Immutable algebraic terms: the matching-logic AST
//!
//! A term is a variable, a token literal, a label application, a computation
//! sequence, a rewrite pair, or an as-binding. Terms are structurally
//! immutable and shared behind [`RcTerm`]; identity is the SHA-256 digest of
//! the canonical JSON form, so two terms are equal exactly when their digests
//! are equal.
//!
//! Canonical JSON uses tagged objects (`{"node": "App", ...}`) and sorted
//! keys; `serde_json::Value` maps are ordered, which makes the digest stable
//! across runs and processes.
//!
//! Terms can be deep (thousands of levels through associative constructors),
//! so every traversal here runs on an explicit work stack; only JSON
//! deserialization recurses, bounded by the JSON parser's own nesting limit.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::utils::hash_str;

/// A sort (symbolic type) name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sort(pub String);

impl Sort {
    pub fn new(name: impl Into<String>) -> Self {
        Sort(name.into())
    }
}

impl std::fmt::Display for Sort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An application label: a name plus parametric sort arguments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub sorts: Vec<Sort>,
}

impl Label {
    pub fn new(name: impl Into<String>) -> Self {
        Label { name: name.into(), sorts: Vec::new() }
    }

    pub fn with_sorts(name: impl Into<String>, sorts: Vec<Sort>) -> Self {
        Label { name: name.into(), sorts }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Shared, immutable term handle.
pub type RcTerm = Arc<Term>;

/// A node in the term AST.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// A (possibly sorted) variable.
    Var { name: String, sort: Option<Sort> },
    /// A textual literal with a sort, e.g. integers and strings.
    Token { token: String, sort: Sort },
    /// A label applied to a tuple of arguments.
    App { label: Label, args: Vec<RcTerm> },
    /// An ordered computation continuation.
    Seq { items: Vec<RcTerm> },
    /// An ordered rewrite pair `lhs => rhs`.
    Rewrite { lhs: RcTerm, rhs: RcTerm },
    /// A sub-pattern bound to a name, `pattern #as name`.
    As { pattern: RcTerm, name: String },
}

/// Errors raised by term construction and (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum TermError {
    #[error("malformed term: unknown node tag `{0}`")]
    MalformedTerm(String),
    #[error("malformed term: {0}")]
    InvalidPayload(String),
    #[error("sort mismatch: declared `{declared}`, inferred `{inferred}`")]
    SortMismatch { declared: Sort, inferred: Sort },
    #[error("free variable `{0}` referenced by quantifier body")]
    FreeVariable(String),
    #[error("unsupported term envelope: {0}")]
    BadEnvelope(String),
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

impl Term {
    pub fn var(name: impl Into<String>) -> RcTerm {
        Arc::new(Term::Var { name: name.into(), sort: None })
    }

    pub fn var_sorted(name: impl Into<String>, sort: Sort) -> RcTerm {
        Arc::new(Term::Var { name: name.into(), sort: Some(sort) })
    }

    pub fn token(token: impl Into<String>, sort: Sort) -> RcTerm {
        Arc::new(Term::Token { token: token.into(), sort })
    }

    pub fn app(label: Label, args: Vec<RcTerm>) -> RcTerm {
        Arc::new(Term::App { label, args })
    }

    /// Application of a plain (sort-parameter-free) label.
    pub fn apply(name: impl Into<String>, args: Vec<RcTerm>) -> RcTerm {
        Term::app(Label::new(name), args)
    }

    pub fn seq(items: Vec<RcTerm>) -> RcTerm {
        Arc::new(Term::Seq { items })
    }

    pub fn rewrite(lhs: RcTerm, rhs: RcTerm) -> RcTerm {
        Arc::new(Term::Rewrite { lhs, rhs })
    }

    pub fn as_binding(pattern: RcTerm, name: impl Into<String>) -> RcTerm {
        Arc::new(Term::As { pattern, name: name.into() })
    }

    /// Borrow the direct children, left to right.
    pub fn children(&self) -> Vec<&RcTerm> {
        match self {
            Term::Var { .. } | Term::Token { .. } => Vec::new(),
            Term::App { args, .. } => args.iter().collect(),
            Term::Seq { items } => items.iter().collect(),
            Term::Rewrite { lhs, rhs } => vec![lhs, rhs],
            Term::As { pattern, .. } => vec![pattern],
        }
    }

    /// Rebuild this node with `children` in place of its current children.
    ///
    /// The child count must match the node's arity; traversals uphold this by
    /// construction.
    pub fn with_children(&self, mut children: Vec<RcTerm>) -> RcTerm {
        match self {
            Term::Var { .. } | Term::Token { .. } => Arc::new(self.clone()),
            Term::App { label, .. } => Term::app(label.clone(), children),
            Term::Seq { .. } => Term::seq(children),
            Term::Rewrite { .. } => {
                let rhs = children.pop().unwrap_or_else(ml_top);
                let lhs = children.pop().unwrap_or_else(ml_top);
                Term::rewrite(lhs, rhs)
            }
            Term::As { name, .. } => {
                let pattern = children.pop().unwrap_or_else(ml_top);
                Term::as_binding(pattern, name.clone())
            }
        }
    }

    /// The sort of this term where it is determined by the term alone.
    ///
    /// Applications do not know their return sort without the definition,
    /// except for sort injections whose target is their second sort argument.
    pub fn sort(&self) -> Option<Sort> {
        match self {
            Term::Var { sort, .. } => sort.clone(),
            Term::Token { sort, .. } => Some(sort.clone()),
            Term::App { label, .. } if label.name == INJ_LABEL => label.sorts.get(1).cloned(),
            Term::App { .. } => None,
            Term::Seq { .. } => Some(Sort::new(SORT_K)),
            Term::Rewrite { lhs, .. } => lhs.sort(),
            Term::As { pattern, .. } => pattern.sort(),
        }
    }
}

// ---------------------------------------------------------------------------
// Traversals (explicit work stacks)
// ---------------------------------------------------------------------------

/// Post-order fold: `f` sees each node together with the results of its
/// children, left to right.
pub fn fold_term<R>(term: &Term, mut f: impl FnMut(&Term, Vec<R>) -> R) -> R {
    enum Task<'a> {
        Visit(&'a Term),
        Build(&'a Term, usize),
    }

    let mut tasks = vec![Task::Visit(term)];
    let mut results: Vec<R> = Vec::new();

    while let Some(task) = tasks.pop() {
        match task {
            Task::Visit(t) => {
                let children = t.children();
                tasks.push(Task::Build(t, children.len()));
                for child in children.into_iter().rev() {
                    tasks.push(Task::Visit(child.as_ref()));
                }
            }
            Task::Build(t, arity) => {
                let child_results = results.split_off(results.len() - arity);
                results.push(f(t, child_results));
            }
        }
    }

    // one Build per Visit leaves exactly the root result
    match results.pop() {
        Some(r) => r,
        None => unreachable!("fold over a nonempty term produced no result"),
    }
}

/// Bottom-up transformation: `f` sees each node after its children have been
/// rebuilt and returns the replacement node.
pub fn bottom_up(term: &Term, mut f: impl FnMut(RcTerm) -> RcTerm) -> RcTerm {
    fold_term(term, |node, children| f(node.with_children(children)))
}

/// Bottom-up fold producing a transformed term and a per-node summary.
///
/// `f` receives the *original* node and the summaries of its children; it is
/// responsible for producing the rebuilt node (typically from state indexed
/// by the summaries, which is what makes memoizing interning pools possible).
pub fn bottom_up_with_summary<S>(
    term: &Term,
    mut f: impl FnMut(&Term, &[S]) -> (RcTerm, S),
) -> (RcTerm, S) {
    fold_term(term, |node, children: Vec<(RcTerm, S)>| {
        let summaries: Vec<S> = children.into_iter().map(|(_, s)| s).collect();
        f(node, &summaries)
    })
}

/// The set of variable names occurring in `term`.
pub fn free_vars(term: &Term) -> BTreeSet<String> {
    let mut vars = BTreeSet::new();
    let mut stack = vec![term];
    while let Some(t) = stack.pop() {
        if let Term::Var { name, .. } = t {
            vars.insert(name.clone());
        }
        for child in t.children() {
            stack.push(child.as_ref());
        }
    }
    vars
}

/// Project the left-hand side of every embedded rewrite.
pub fn extract_lhs(term: &Term) -> RcTerm {
    bottom_up(term, |t| match t.as_ref() {
        Term::Rewrite { lhs, .. } => lhs.clone(),
        _ => t,
    })
}

/// Project the right-hand side of every embedded rewrite.
pub fn extract_rhs(term: &Term) -> RcTerm {
    bottom_up(term, |t| match t.as_ref() {
        Term::Rewrite { rhs, .. } => rhs.clone(),
        _ => t,
    })
}

// ---------------------------------------------------------------------------
// Canonical JSON and digests
// ---------------------------------------------------------------------------

/// Wire envelope format tag.
pub const WIRE_FORMAT: &str = "MLTERM";
/// Wire envelope schema version.
pub const WIRE_VERSION: u64 = 1;

impl Term {
    /// Canonical JSON value. Map keys serialize sorted, so the rendered
    /// string is unique per term.
    pub fn to_value(&self) -> Value {
        fold_term(self, |node, children: Vec<Value>| match node {
            Term::Var { name, sort } => {
                let mut obj = Map::new();
                obj.insert("node".into(), json!("Var"));
                obj.insert("name".into(), json!(name));
                if let Some(sort) = sort {
                    obj.insert("sort".into(), json!(sort.0));
                }
                Value::Object(obj)
            }
            Term::Token { token, sort } => json!({
                "node": "Token",
                "token": token,
                "sort": sort.0,
            }),
            Term::App { label, .. } => json!({
                "node": "App",
                "label": label.name,
                "sorts": label.sorts.iter().map(|s| s.0.clone()).collect::<Vec<_>>(),
                "args": children,
            }),
            Term::Seq { .. } => json!({
                "node": "Seq",
                "items": children,
            }),
            Term::Rewrite { .. } => json!({
                "node": "Rewrite",
                "lhs": children[0],
                "rhs": children[1],
            }),
            Term::As { name, .. } => json!({
                "node": "As",
                "pattern": children[0],
                "name": name,
            }),
        })
    }

    /// Parse a canonical JSON value back into a term.
    pub fn from_value(value: &Value) -> Result<RcTerm, TermError> {
        let obj = value
            .as_object()
            .ok_or_else(|| TermError::InvalidPayload(format!("expected object, got {value}")))?;
        let tag = obj
            .get("node")
            .and_then(Value::as_str)
            .ok_or_else(|| TermError::InvalidPayload("missing `node` tag".into()))?;
        match tag {
            "Var" => {
                let name = str_field(obj, "name")?;
                let sort = match obj.get("sort") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(Sort::new(s.clone())),
                    Some(other) => {
                        return Err(TermError::InvalidPayload(format!("bad sort: {other}")))
                    }
                };
                Ok(Arc::new(Term::Var { name, sort }))
            }
            "Token" => {
                let token = str_field(obj, "token")?;
                let sort = Sort::new(str_field(obj, "sort")?);
                Ok(Term::token(token, sort))
            }
            "App" => {
                let label_name = str_field(obj, "label")?;
                let sorts = match obj.get("sorts") {
                    None => Vec::new(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|s| {
                            s.as_str().map(Sort::new).ok_or_else(|| {
                                TermError::InvalidPayload(format!("bad sort parameter: {s}"))
                            })
                        })
                        .collect::<Result<_, _>>()?,
                    Some(other) => {
                        return Err(TermError::InvalidPayload(format!("bad sorts: {other}")))
                    }
                };
                let args = array_field(obj, "args")?
                    .iter()
                    .map(Term::from_value)
                    .collect::<Result<_, _>>()?;
                Ok(Term::app(Label::with_sorts(label_name, sorts), args))
            }
            "Seq" => {
                let items = array_field(obj, "items")?
                    .iter()
                    .map(Term::from_value)
                    .collect::<Result<_, _>>()?;
                Ok(Term::seq(items))
            }
            "Rewrite" => {
                let lhs = Term::from_value(
                    obj.get("lhs")
                        .ok_or_else(|| TermError::InvalidPayload("rewrite without lhs".into()))?,
                )?;
                let rhs = Term::from_value(
                    obj.get("rhs")
                        .ok_or_else(|| TermError::InvalidPayload("rewrite without rhs".into()))?,
                )?;
                Ok(Term::rewrite(lhs, rhs))
            }
            "As" => {
                let pattern = Term::from_value(
                    obj.get("pattern")
                        .ok_or_else(|| TermError::InvalidPayload("as-binding without pattern".into()))?,
                )?;
                let name = str_field(obj, "name")?;
                Ok(Term::as_binding(pattern, name))
            }
            other => Err(TermError::MalformedTerm(other.to_string())),
        }
    }

    /// The canonical JSON string (sorted keys, no whitespace).
    pub fn canonical_json(&self) -> String {
        self.to_value().to_string()
    }

    /// Content digest: SHA-256 hex of the canonical JSON.
    pub fn digest(&self) -> String {
        hash_str(self.canonical_json())
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Result<String, TermError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TermError::InvalidPayload(format!("missing string field `{key}`")))
}

fn array_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a Vec<Value>, TermError> {
    obj.get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| TermError::InvalidPayload(format!("missing array field `{key}`")))
}

/// Wrap a term in the versioned wire envelope.
pub fn to_wire(term: &RcTerm) -> Value {
    json!({
        "format": WIRE_FORMAT,
        "version": WIRE_VERSION,
        "term": term.to_value(),
    })
}

/// Unwrap the versioned wire envelope.
pub fn from_wire(value: &Value) -> Result<RcTerm, TermError> {
    let obj = value
        .as_object()
        .ok_or_else(|| TermError::BadEnvelope(format!("expected object, got {value}")))?;
    match obj.get("format").and_then(Value::as_str) {
        Some(WIRE_FORMAT) => {}
        other => return Err(TermError::BadEnvelope(format!("format {other:?}"))),
    }
    match obj.get("version").and_then(Value::as_u64) {
        Some(WIRE_VERSION) => {}
        other => return Err(TermError::BadEnvelope(format!("version {other:?}"))),
    }
    Term::from_value(
        obj.get("term")
            .ok_or_else(|| TermError::BadEnvelope("missing term".into()))?,
    )
}

impl Serialize for Term {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Term {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let term = Term::from_value(&value).map_err(D::Error::custom)?;
        Ok(Arc::try_unwrap(term).unwrap_or_else(|rc| (*rc).clone()))
    }
}

// ---------------------------------------------------------------------------
// Matching-logic prelude
// ---------------------------------------------------------------------------

pub const SORT_K: &str = "K";
pub const SORT_BOOL: &str = "Bool";
pub const SORT_INT: &str = "Int";
pub const SORT_STRING: &str = "String";
/// The sort of whole configurations (the cell tree root).
pub const SORT_TOP_CELL: &str = "GeneratedTopCell";

/// Label of sort-injection applications.
pub const INJ_LABEL: &str = "inj";

pub const ML_TOP: &str = "#Top";
pub const ML_BOTTOM: &str = "#Bottom";
pub const ML_AND: &str = "#And";
pub const ML_NOT: &str = "#Not";
pub const ML_IMPLIES: &str = "#Implies";
pub const ML_EQUALS: &str = "#Equals";
pub const ML_EXISTS: &str = "#Exists";
pub const ML_CEIL: &str = "#Ceil";

fn pred_label(name: &str) -> Label {
    Label::with_sorts(name, vec![Sort::new(SORT_TOP_CELL)])
}

/// The trivially true predicate.
pub fn ml_top() -> RcTerm {
    Term::app(pred_label(ML_TOP), vec![])
}

/// The unsatisfiable predicate.
pub fn ml_bottom() -> RcTerm {
    Term::app(pred_label(ML_BOTTOM), vec![])
}

pub fn is_top(term: &Term) -> bool {
    matches!(term, Term::App { label, .. } if label.name == ML_TOP)
}

pub fn is_bottom(term: &Term) -> bool {
    matches!(term, Term::App { label, .. } if label.name == ML_BOTTOM)
}

/// Right-nested conjunction; empty input is `#Top`, singletons collapse.
pub fn ml_and(preds: impl IntoIterator<Item = RcTerm>) -> RcTerm {
    let mut preds: Vec<RcTerm> = preds.into_iter().filter(|p| !is_top(p)).collect();
    match preds.len() {
        0 => ml_top(),
        1 => preds.remove(0),
        _ => {
            let mut acc = preds.pop().unwrap_or_else(ml_top);
            while let Some(p) = preds.pop() {
                acc = Term::app(pred_label(ML_AND), vec![p, acc]);
            }
            acc
        }
    }
}

pub fn ml_not(pred: RcTerm) -> RcTerm {
    Term::app(pred_label(ML_NOT), vec![pred])
}

pub fn ml_implies(antecedent: RcTerm, consequent: RcTerm) -> RcTerm {
    Term::app(pred_label(ML_IMPLIES), vec![antecedent, consequent])
}

pub fn ml_equals(lhs: RcTerm, rhs: RcTerm) -> RcTerm {
    Term::app(pred_label(ML_EQUALS), vec![lhs, rhs])
}

/// `#Equals(true, b)`: lift a boolean term into a predicate.
pub fn ml_equals_true(b: RcTerm) -> RcTerm {
    ml_equals(bool_token(true), b)
}

pub fn ml_exists(var: RcTerm, body: RcTerm) -> RcTerm {
    Term::app(pred_label(ML_EXISTS), vec![var, body])
}

pub fn ml_ceil(term: RcTerm) -> RcTerm {
    Term::app(pred_label(ML_CEIL), vec![term])
}

/// Flatten a nested `#And` into its conjuncts, dropping `#Top`.
pub fn flatten_and(term: &RcTerm) -> Vec<RcTerm> {
    let mut out = Vec::new();
    let mut stack = vec![term.clone()];
    while let Some(t) = stack.pop() {
        match t.as_ref() {
            Term::App { label, args } if label.name == ML_AND => {
                for arg in args.iter().rev() {
                    stack.push(arg.clone());
                }
            }
            _ if is_top(&t) => {}
            _ => out.push(t),
        }
    }
    out
}

/// Lift a boolean term into predicates: `andBool` conjunctions are split,
/// the `true` token becomes no predicate at all.
pub fn bool_to_ml_pred(b: &RcTerm) -> RcTerm {
    let mut conjuncts = Vec::new();
    let mut stack = vec![b.clone()];
    while let Some(t) = stack.pop() {
        match t.as_ref() {
            Term::App { label, args } if label.name == "_andBool_" && args.len() == 2 => {
                stack.push(args[1].clone());
                stack.push(args[0].clone());
            }
            Term::Token { token, sort } if sort.0 == SORT_BOOL && token == "true" => {}
            _ => conjuncts.push(ml_equals_true(t)),
        }
    }
    ml_and(conjuncts)
}

/// Project a predicate back to a boolean term where the shape admits it.
pub fn ml_pred_to_bool(pred: &RcTerm) -> Option<RcTerm> {
    match pred.as_ref() {
        Term::App { label, args } if label.name == ML_EQUALS && args.len() == 2 => {
            match args[0].as_ref() {
                Term::Token { token, sort } if sort.0 == SORT_BOOL && token == "true" => {
                    Some(args[1].clone())
                }
                _ => None,
            }
        }
        _ if is_top(pred) => Some(bool_token(true)),
        _ => None,
    }
}

pub fn int_token(i: i64) -> RcTerm {
    Term::token(i.to_string(), Sort::new(SORT_INT))
}

pub fn bool_token(b: bool) -> RcTerm {
    Term::token(b.to_string(), Sort::new(SORT_BOOL))
}

pub fn string_token(s: impl Into<String>) -> RcTerm {
    Term::token(s, Sort::new(SORT_STRING))
}

/// A sort-injection application `inj{from, to}(term)`.
pub fn inj(from: Sort, to: Sort, term: RcTerm) -> RcTerm {
    Term::app(Label::with_sorts(INJ_LABEL, vec![from, to]), vec![term])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RcTerm {
        Term::apply(
            "<top>",
            vec![Term::seq(vec![
                Term::apply("run", vec![Term::var_sorted("N", Sort::new(SORT_INT))]),
                Term::var("REST"),
            ])],
        )
    }

    #[test]
    fn json_roundtrip_is_identity() {
        let t = sample();
        let back = Term::from_value(&t.to_value()).unwrap();
        assert_eq!(*t, *back);
        assert_eq!(t.digest(), back.digest());
    }

    #[test]
    fn wire_envelope_roundtrip() {
        let t = ml_and(vec![ml_equals_true(Term::var("B")), ml_equals(Term::var("X"), int_token(1))]);
        let back = from_wire(&to_wire(&t)).unwrap();
        assert_eq!(*t, *back);
    }

    #[test]
    fn wire_envelope_rejects_bad_version() {
        let mut wire = to_wire(&sample());
        wire["version"] = serde_json::json!(99);
        assert!(matches!(from_wire(&wire), Err(TermError::BadEnvelope(_))));
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let err = Term::from_value(&serde_json::json!({"node": "Lambda"})).unwrap_err();
        assert!(matches!(err, TermError::MalformedTerm(tag) if tag == "Lambda"));
    }

    #[test]
    fn digest_distinguishes_structure() {
        let a = Term::apply("f", vec![int_token(1), int_token(2)]);
        let b = Term::apply("f", vec![int_token(2), int_token(1)]);
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), Term::apply("f", vec![int_token(1), int_token(2)]).digest());
    }

    #[test]
    fn free_vars_collects_all_occurrences() {
        let t = Term::rewrite(
            Term::apply("f", vec![Term::var("X"), Term::var("Y")]),
            Term::as_binding(Term::var("X"), "alias"),
        );
        let vars = free_vars(&t);
        assert_eq!(vars.into_iter().collect::<Vec<_>>(), vec!["X".to_string(), "Y".to_string()]);
    }

    #[test]
    fn extract_lhs_rhs_project_rewrites() {
        let body = Term::apply(
            "<top>",
            vec![Term::rewrite(Term::apply("run", vec![Term::var("N")]), Term::apply("done", vec![Term::var("N")]))],
        );
        let lhs = extract_lhs(&body);
        let rhs = extract_rhs(&body);
        assert_eq!(*lhs, *Term::apply("<top>", vec![Term::apply("run", vec![Term::var("N")])]));
        assert_eq!(*rhs, *Term::apply("<top>", vec![Term::apply("done", vec![Term::var("N")])]));
    }

    #[test]
    fn flatten_and_inverts_ml_and() {
        let parts = vec![
            ml_equals_true(Term::var("A")),
            ml_equals_true(Term::var("B")),
            ml_equals_true(Term::var("C")),
        ];
        let conj = ml_and(parts.clone());
        assert_eq!(flatten_and(&conj), parts);
        assert!(flatten_and(&ml_top()).is_empty());
    }

    #[test]
    fn bool_pred_conversions() {
        let b = Term::apply("_andBool_", vec![Term::var("P"), Term::var("Q")]);
        let pred = bool_to_ml_pred(&b);
        let conjuncts = flatten_and(&pred);
        assert_eq!(conjuncts.len(), 2);
        assert_eq!(ml_pred_to_bool(&conjuncts[0]), Some(Term::var("P")));
        assert!(is_top(&bool_to_ml_pred(&bool_token(true))));
    }

    #[test]
    fn deep_terms_traverse_on_a_work_stack() {
        // deep enough that naive recursion in the traversals would blow the
        // 2 MiB test stack, shallow enough for the JSON layer
        let mut t = int_token(0);
        for _ in 0..2_000 {
            t = Term::apply("s", vec![t]);
        }
        let digest = t.digest();
        assert_eq!(digest.len(), 64);
        let rebuilt = bottom_up(&t, |node| node);
        assert_eq!(rebuilt.digest(), digest);
        assert_eq!(free_vars(&t).len(), 0);
    }

    #[test]
    fn random_terms_roundtrip_and_hash_consistently() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        fn gen_term(rng: &mut StdRng, depth: u8) -> RcTerm {
            match if depth == 0 { rng.gen_range(0..3) } else { rng.gen_range(0..6) } {
                0 => Term::var(format!("V{}", rng.gen_range(0..5))),
                1 => int_token(rng.gen_range(-100..100)),
                2 => Term::var_sorted(format!("S{}", rng.gen_range(0..3)), Sort::new(SORT_INT)),
                3 => {
                    let arity = rng.gen_range(0..3);
                    let args = (0..arity).map(|_| gen_term(rng, depth - 1)).collect();
                    Term::apply(format!("f{}", rng.gen_range(0..4)), args)
                }
                4 => {
                    let len = rng.gen_range(0..3);
                    Term::seq((0..len).map(|_| gen_term(rng, depth - 1)).collect())
                }
                _ => Term::rewrite(gen_term(rng, depth - 1), gen_term(rng, depth - 1)),
            }
        }

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let terms: Vec<RcTerm> = (0..64).map(|_| gen_term(&mut rng, 4)).collect();
        for t in &terms {
            let back = Term::from_value(&t.to_value()).unwrap();
            assert_eq!(**t, *back);
            assert_eq!(t.digest(), back.digest());
        }
        // digests agree exactly when terms agree
        for a in &terms {
            for b in &terms {
                assert_eq!(a == b, a.digest() == b.digest());
            }
        }
    }

    #[test]
    fn summary_fold_counts_nodes() {
        let t = sample();
        let (rebuilt, count) = bottom_up_with_summary(&t, |node, summaries: &[usize]| {
            let total: usize = 1 + summaries.iter().sum::<usize>();
            (Arc::new(node.clone()), total)
        });
        // <top>, the sequence, `run`, and the two variables
        assert_eq!(count, 5);
        assert_eq!(rebuilt.children().len(), t.children().len());
    }
}
