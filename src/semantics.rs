//! Hooks a semantics supplies to steer exploration.
//!
//! The prover itself is semantics-agnostic; everything language-specific
//! arrives through this trait: which states count as final, how to read
//! branch conditions out of a configuration, how to widen a state to a loop
//! head, and which rule labels the backend should treat as halting points.

use crate::cterm::CTerm;
use crate::term::RcTerm;

pub trait Semantics: Send + Sync {
    /// Is this configuration a final state of the language?
    fn is_terminal(&self, _cterm: &CTerm) -> bool {
        false
    }

    /// Branch conditions readable directly off the configuration (e.g. a
    /// symbolic `if` at the top of the continuation). When the returned
    /// conditions line up one-to-one with the backend's next states, the
    /// prover builds a case split instead of a nondeterministic branch.
    fn extract_branches(&self, _cterm: &CTerm) -> Vec<RcTerm> {
        Vec::new()
    }

    /// Widen a state (e.g. forget loop-variant bindings). Returning
    /// something different makes the prover cover the node into its
    /// widened form instead of extending it.
    fn abstract_node(&self, cterm: &CTerm) -> CTerm {
        cterm.clone()
    }

    /// Are the two states iterations of the same loop? Drives the bounded
    /// model checking depth accounting.
    fn same_loop(&self, _a: &CTerm, _b: &CTerm) -> bool {
        false
    }

    /// Rule labels the backend must stop and report on.
    fn cut_point_rules(&self) -> Vec<String> {
        Vec::new()
    }

    /// Rule labels the backend must treat as halting.
    fn terminal_rules(&self) -> Vec<String> {
        Vec::new()
    }
}

/// The neutral semantics: nothing is terminal, nothing branches early,
/// nothing is widened.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSemantics;

impl Semantics for DefaultSemantics {}
