//! Constrained terms: a configuration paired with its path constraints.
//!
//! A [`CTerm`] is the unit of state in the proof graph: the configuration
//! cell tree plus an ordered set of matching-logic predicates. Constraints
//! are normalized on construction (`#Top` dropped, duplicates removed,
//! canonical order), so the content digest is independent of the order in
//! which constraints were discovered.
//!
//! [`match_with_constraint`] is the syntactic half of subsumption: it finds a
//! substitution instantiating the consequent's configuration to the
//! antecedent's and collects the consequent's constraints as residual
//! obligations. Predicate discharge is the backend's job (`implies`); match
//! failure is an expected outcome in proof search and is therefore a `None`,
//! never an error.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};

use crate::definition::SubsortLattice;
use crate::subst::Subst;
use crate::term::{
    flatten_and, free_vars, is_bottom, is_top, ml_and, RcTerm, Term, TermError, INJ_LABEL, SORT_K,
};
use crate::utils::hash_str;

/// A configuration term under a set of path constraints.
#[derive(Debug, Clone)]
pub struct CTerm {
    config: RcTerm,
    constraints: Vec<RcTerm>,
    hash: String,
}

impl PartialEq for CTerm {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for CTerm {}

impl CTerm {
    /// Build a constrained term, normalizing the constraint set.
    pub fn new(config: RcTerm, constraints: impl IntoIterator<Item = RcTerm>) -> Self {
        let mut normalized: Vec<RcTerm> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for constraint in constraints.into_iter().flat_map(|c| flatten_and(&c)) {
            if is_top(&constraint) {
                continue;
            }
            let key = constraint.canonical_json();
            if seen.insert(key) {
                normalized.push(constraint);
            }
        }
        normalized.sort_by_key(|c| c.canonical_json());
        let hash = hash_str(
            json!({
                "config": config.to_value(),
                "constraints": normalized.iter().map(|c| c.to_value()).collect::<Vec<_>>(),
            })
            .to_string(),
        );
        CTerm { config, constraints: normalized, hash }
    }

    /// An unconstrained configuration.
    pub fn from_config(config: RcTerm) -> Self {
        CTerm::new(config, [])
    }

    pub fn config(&self) -> &RcTerm {
        &self.config
    }

    pub fn constraints(&self) -> &[RcTerm] {
        &self.constraints
    }

    /// The content digest; node identity in the proof graph.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The constraints as one conjunction.
    pub fn constraint(&self) -> RcTerm {
        ml_and(self.constraints.iter().cloned())
    }

    /// Append a constraint (deduplicated, renormalized).
    pub fn add_constraint(&self, constraint: RcTerm) -> CTerm {
        CTerm::new(
            self.config.clone(),
            self.constraints.iter().cloned().chain([constraint]),
        )
    }

    /// True iff `#Bottom` occurs as the configuration or among constraints.
    pub fn is_bottom(&self) -> bool {
        is_bottom(&self.config) || self.constraints.iter().any(|c| is_bottom(c))
    }

    pub fn free_vars(&self) -> BTreeSet<String> {
        let mut vars = free_vars(&self.config);
        for c in &self.constraints {
            vars.extend(free_vars(c));
        }
        vars
    }

    /// Project the named cell out of the configuration tree.
    ///
    /// Returns the cell's contents for unary cells, or the cell application
    /// itself otherwise.
    pub fn cell(&self, name: &str) -> Option<RcTerm> {
        let mut stack = vec![self.config.clone()];
        while let Some(t) = stack.pop() {
            if let Term::App { label, args } = t.as_ref() {
                if label.name == name {
                    return match args.as_slice() {
                        [only] => Some(only.clone()),
                        _ => Some(t.clone()),
                    };
                }
            }
            for child in t.children() {
                stack.push(child.clone());
            }
        }
        None
    }

    pub fn to_value(&self) -> Value {
        json!({
            "config": self.config.to_value(),
            "constraints": self.constraints.iter().map(|c| c.to_value()).collect::<Vec<_>>(),
        })
    }

    pub fn from_value(value: &Value) -> Result<CTerm, TermError> {
        let obj = value
            .as_object()
            .ok_or_else(|| TermError::InvalidPayload(format!("expected object, got {value}")))?;
        let config = Term::from_value(
            obj.get("config")
                .ok_or_else(|| TermError::InvalidPayload("missing config".into()))?,
        )?;
        let constraints = match obj.get("constraints") {
            None => Vec::new(),
            Some(Value::Array(items)) => {
                items.iter().map(Term::from_value).collect::<Result<_, _>>()?
            }
            Some(other) => {
                return Err(TermError::InvalidPayload(format!("bad constraints: {other}")))
            }
        };
        Ok(CTerm::new(config, constraints))
    }
}

/// A constrained substitution: the witness of an implication between two
/// constrained terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CSubst {
    pub subst: Subst,
    pub constraints: Vec<RcTerm>,
}

impl CSubst {
    pub fn new(subst: Subst, constraints: impl IntoIterator<Item = RcTerm>) -> Self {
        let mut normalized: Vec<RcTerm> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for constraint in constraints.into_iter().flat_map(|c| flatten_and(&c)) {
            if is_top(&constraint) {
                continue;
            }
            if seen.insert(constraint.canonical_json()) {
                normalized.push(constraint);
            }
        }
        CSubst { subst, constraints: normalized }
    }

    /// A witness with constraints only (identity substitution).
    pub fn from_constraints(constraints: impl IntoIterator<Item = RcTerm>) -> Self {
        CSubst::new(Subst::new(), constraints)
    }

    /// The constraint part as one conjunction.
    pub fn constraint(&self) -> RcTerm {
        ml_and(self.constraints.iter().cloned())
    }

    /// Instantiate a constrained term under this witness.
    pub fn apply(&self, cterm: &CTerm) -> CTerm {
        let config = self.subst.apply(cterm.config());
        let constraints = cterm
            .constraints()
            .iter()
            .map(|c| self.subst.apply(c))
            .chain(self.constraints.iter().cloned());
        CTerm::new(config, constraints)
    }

    pub fn add_constraint(&self, constraint: RcTerm) -> CSubst {
        CSubst::new(
            self.subst.clone(),
            self.constraints.iter().cloned().chain([constraint]),
        )
    }

    pub fn to_value(&self) -> Value {
        let mut subst = Map::new();
        for (name, image) in self.subst.iter() {
            subst.insert(name.clone(), image.to_value());
        }
        json!({
            "subst": Value::Object(subst),
            "constraints": self.constraints.iter().map(|c| c.to_value()).collect::<Vec<_>>(),
        })
    }

    pub fn from_value(value: &Value) -> Result<CSubst, TermError> {
        let obj = value
            .as_object()
            .ok_or_else(|| TermError::InvalidPayload(format!("expected object, got {value}")))?;
        let mut subst = Subst::new();
        if let Some(Value::Object(bindings)) = obj.get("subst") {
            for (name, image) in bindings {
                let image = Term::from_value(image)?;
                subst
                    .bind(name.clone(), image)
                    .map_err(|e| TermError::InvalidPayload(e.to_string()))?;
            }
        }
        let constraints = match obj.get("constraints") {
            None => Vec::new(),
            Some(Value::Array(items)) => {
                items.iter().map(Term::from_value).collect::<Result<_, _>>()?
            }
            Some(other) => {
                return Err(TermError::InvalidPayload(format!("bad constraints: {other}")))
            }
        };
        Ok(CSubst::new(subst, constraints))
    }
}

/// Match the antecedent `a` against the more general consequent `b`.
///
/// On success the returned witness satisfies
/// `subst.apply(b.config()) == a.config()` syntactically, and carries each of
/// `b`'s constraints (instantiated) that is not already among `a`'s as a
/// residual obligation for the backend to discharge.
pub fn match_with_constraint(a: &CTerm, b: &CTerm) -> Option<CSubst> {
    match_with_constraint_in(a, b, None)
}

/// [`match_with_constraint`] with a subsort lattice for injection handling.
pub fn match_with_constraint_in(
    a: &CTerm,
    b: &CTerm,
    lattice: Option<&SubsortLattice>,
) -> Option<CSubst> {
    let subst = match_config(b.config(), a.config(), lattice)?;
    let present: BTreeSet<String> = a.constraints().iter().map(|c| c.canonical_json()).collect();
    let obligations: Vec<RcTerm> = b
        .constraints()
        .iter()
        .map(|c| subst.apply(c))
        .filter(|c| !is_top(c) && !present.contains(&c.canonical_json()))
        .collect();
    Some(CSubst::new(subst, obligations))
}

/// Syntactic one-sided matching of `pattern` against `subject`.
fn match_config(
    pattern: &RcTerm,
    subject: &RcTerm,
    lattice: Option<&SubsortLattice>,
) -> Option<Subst> {
    let mut subst = Subst::new();
    let mut worklist: Vec<(RcTerm, RcTerm)> = vec![(pattern.clone(), subject.clone())];

    while let Some((pat, sub)) = worklist.pop() {
        match pat.as_ref() {
            Term::Var { name, sort } => {
                if let (Some(want), Some(have)) = (sort, sub.sort()) {
                    if *want != have && !admits(lattice, &have, want) {
                        return None;
                    }
                }
                if subst.bind(name.clone(), sub).is_err() {
                    return None;
                }
            }
            Term::As { pattern: inner, name } => {
                if subst.bind(name.clone(), sub.clone()).is_err() {
                    return None;
                }
                worklist.push((inner.clone(), sub));
            }
            Term::Token { .. } => {
                if pat.as_ref() != sub.as_ref() {
                    return None;
                }
            }
            Term::App { label, args } => match sub.as_ref() {
                Term::App { label: sub_label, args: sub_args } if label == sub_label => {
                    if args.len() != sub_args.len() {
                        return None;
                    }
                    for pair in args.iter().cloned().zip(sub_args.iter().cloned()) {
                        worklist.push(pair);
                    }
                }
                _ => {
                    // Sort-mismatch repair: drop an injection from either side
                    // when the subsort lattice admits it.
                    if let Some((inner, from, _to)) = as_injection(&pat) {
                        if sort_of_or_unknown(lattice, &sub, &from) {
                            worklist.push((inner, sub));
                            continue;
                        }
                    }
                    if let Some((inner, _from, _to)) = as_injection(&sub) {
                        if lattice.is_some() {
                            worklist.push((pat, inner));
                            continue;
                        }
                    }
                    return None;
                }
            },
            Term::Seq { items } => {
                let Term::Seq { items: sub_items } = sub.as_ref() else {
                    return None;
                };
                match items.split_last() {
                    Some((last, init)) if is_suffix_var(last) && sub_items.len() >= init.len() => {
                        for pair in init.iter().cloned().zip(sub_items.iter().cloned()) {
                            worklist.push(pair);
                        }
                        let rest = Term::seq(sub_items[init.len()..].to_vec());
                        worklist.push((last.clone(), rest));
                    }
                    _ => {
                        if items.len() != sub_items.len() {
                            return None;
                        }
                        for pair in items.iter().cloned().zip(sub_items.iter().cloned()) {
                            worklist.push(pair);
                        }
                    }
                }
            }
            Term::Rewrite { lhs, rhs } => {
                let Term::Rewrite { lhs: sub_lhs, rhs: sub_rhs } = sub.as_ref() else {
                    return None;
                };
                worklist.push((lhs.clone(), sub_lhs.clone()));
                worklist.push((rhs.clone(), sub_rhs.clone()));
            }
        }
    }

    Some(subst)
}

/// A trailing sequence variable absorbs the rest of the computation.
fn is_suffix_var(term: &RcTerm) -> bool {
    match term.as_ref() {
        Term::Var { sort: None, .. } => true,
        Term::Var { sort: Some(sort), .. } => sort.0 == SORT_K,
        _ => false,
    }
}

fn as_injection(term: &RcTerm) -> Option<(RcTerm, crate::term::Sort, crate::term::Sort)> {
    match term.as_ref() {
        Term::App { label, args }
            if label.name == INJ_LABEL && label.sorts.len() == 2 && args.len() == 1 =>
        {
            Some((args[0].clone(), label.sorts[0].clone(), label.sorts[1].clone()))
        }
        _ => None,
    }
}

fn admits(lattice: Option<&SubsortLattice>, sub: &crate::term::Sort, sup: &crate::term::Sort) -> bool {
    lattice.map_or(false, |l| l.admits(sub, sup))
}

/// Does `term` have sort `want`, or an undetermined sort (which we accept)?
fn sort_of_or_unknown(
    lattice: Option<&SubsortLattice>,
    term: &RcTerm,
    want: &crate::term::Sort,
) -> bool {
    match term.sort() {
        None => true,
        Some(have) => have == *want || admits(lattice, &have, want),
    }
}
