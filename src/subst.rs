//! Substitutions: finite maps from variable names to terms.
//!
//! Application is structural (variables are globally named, so no
//! alpha-renaming is needed); composition satisfies
//! `compose(s, t).apply(x) == s.apply(&t.apply(x))`. A substitution also
//! round-trips through its predicate form, a conjunction of variable
//! equalities, which is how implication witnesses arrive from the backend.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::term::{
    bottom_up, flatten_and, free_vars, is_top, ml_and, ml_equals, RcTerm, Term,
};

/// Errors from interpreting terms as substitutions.
#[derive(Debug, thiserror::Error)]
pub enum SubstError {
    #[error("not a substitution: {0}")]
    NotASubstitution(String),
    #[error("conflicting bindings for `{0}`")]
    ConflictingBinding(String),
}

/// A finite mapping from variable names to terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subst {
    map: BTreeMap<String, RcTerm>,
}

impl Subst {
    pub fn new() -> Self {
        Subst::default()
    }

    pub fn from_iter(bindings: impl IntoIterator<Item = (String, RcTerm)>) -> Self {
        Subst { map: bindings.into_iter().collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn get(&self, name: &str) -> Option<&RcTerm> {
        self.map.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RcTerm)> {
        self.map.iter()
    }

    /// Bind `name`, failing on a conflicting existing binding.
    pub fn bind(&mut self, name: impl Into<String>, term: RcTerm) -> Result<(), SubstError> {
        let name = name.into();
        match self.map.entry(name) {
            Entry::Vacant(e) => {
                e.insert(term);
                Ok(())
            }
            Entry::Occupied(e) => {
                if *e.get() == term {
                    Ok(())
                } else {
                    Err(SubstError::ConflictingBinding(e.key().clone()))
                }
            }
        }
    }

    /// Replace free occurrences of bound variables with their images.
    pub fn apply(&self, term: &Term) -> RcTerm {
        if self.map.is_empty() {
            return std::sync::Arc::new(term.clone());
        }
        bottom_up(term, |t| match t.as_ref() {
            Term::Var { name, .. } => match self.map.get(name) {
                Some(image) => image.clone(),
                None => t,
            },
            _ => t,
        })
    }

    /// `compose(self, other)` applies `other` first, then `self`.
    pub fn compose(&self, other: &Subst) -> Subst {
        let mut map: BTreeMap<String, RcTerm> = other
            .map
            .iter()
            .map(|(name, image)| (name.clone(), self.apply(image)))
            .collect();
        for (name, image) in &self.map {
            map.entry(name.clone()).or_insert_with(|| image.clone());
        }
        Subst { map }
    }

    /// Merge two substitutions; `None` when they disagree on a variable.
    pub fn union(&self, other: &Subst) -> Option<Subst> {
        let mut merged = self.clone();
        for (name, image) in &other.map {
            match merged.bind(name.clone(), image.clone()) {
                Ok(()) => {}
                Err(_) => return None,
            }
        }
        Some(merged)
    }

    /// A substitution is ground when every image is closed.
    pub fn is_ground(&self) -> bool {
        self.map.values().all(|image| free_vars(image).is_empty())
    }

    /// Render as a conjunction of `#Equals(var, image)` predicates.
    pub fn ml_pred(&self) -> RcTerm {
        ml_and(
            self.map
                .iter()
                .map(|(name, image)| ml_equals(Term::var(name.clone()), image.clone())),
        )
    }

    /// Parse a conjunction of variable equalities back into a substitution.
    pub fn from_pred(pred: &RcTerm) -> Result<Subst, SubstError> {
        let mut subst = Subst::new();
        for conjunct in flatten_and(pred) {
            if is_top(&conjunct) {
                continue;
            }
            let Term::App { label, args } = conjunct.as_ref() else {
                return Err(SubstError::NotASubstitution(conjunct.canonical_json()));
            };
            if label.name != crate::term::ML_EQUALS || args.len() != 2 {
                return Err(SubstError::NotASubstitution(conjunct.canonical_json()));
            }
            let Term::Var { name, .. } = args[0].as_ref() else {
                return Err(SubstError::NotASubstitution(conjunct.canonical_json()));
            };
            subst.bind(name.clone(), args[1].clone())?;
        }
        Ok(subst)
    }
}

impl FromIterator<(String, RcTerm)> for Subst {
    fn from_iter<I: IntoIterator<Item = (String, RcTerm)>>(iter: I) -> Self {
        Subst::from_iter(iter)
    }
}

/// Rename generated variables (`_`-prefixed) to a fresh `_V<n>` family,
/// consistently within the term. Used to keep claim instantiations apart.
pub fn rename_generated_vars(term: &Term, counter: &mut u64) -> RcTerm {
    let mut renaming: BTreeMap<String, String> = BTreeMap::new();
    bottom_up(term, |t| match t.as_ref() {
        Term::Var { name, sort } if name.starts_with('_') => {
            let fresh = renaming.entry(name.clone()).or_insert_with(|| {
                let fresh = format!("_V{counter}");
                *counter += 1;
                fresh
            });
            match sort {
                Some(sort) => Term::var_sorted(fresh.clone(), sort.clone()),
                None => Term::var(fresh.clone()),
            }
        }
        _ => t,
    })
}
