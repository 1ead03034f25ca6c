//! Crate root: public surface and protocol-wide invariants
//!
//! `allpath` drives all-path reachability proofs over a rewriting-based
//! semantics. A claim `lhs => rhs requires P ensures Q` becomes a control-flow
//! graph with one init and one target node; the prover repeatedly picks a
//! pending leaf, asks the execution backend whether it is subsumed by the
//! target, and otherwise extends it by one or more rewrite steps. The
//! exploration is recorded as a labeled graph whose paths witness (or refute)
//! the claim.
//!
//! ## Invariants
//!
//! - **Content addressing.** A node's identity is the SHA-256 digest of its
//!   constrained term's canonical JSON. Two nodes are equal iff their digests
//!   are equal; the graph stores at most one node per digest.
//! - **Single successor.** Every node has at most one outgoing successor
//!   (edge, cover, split or non-deterministic branch). All successor
//!   constructors enforce this before mutating the graph.
//! - **Single-owner graph.** All graph reads and writes happen on the prover
//!   task. Backend RPC calls are the only suspension points; a worker pool
//!   may parallelize them, but commits are serialized through the owner.
//! - **Local failure.** A failed proof step is recorded on its node and the
//!   loop continues. Only user input errors and graph invariant violations
//!   abort the process.

#![forbid(unsafe_code)]

/// Immutable algebraic terms, canonical JSON and content digests.
pub mod term;
/// Substitutions: application, composition, equality-conjunction round-trip.
pub mod subst;
/// Constrained terms and the syntactic subsumption match.
pub mod cterm;
/// Claims and their canonical attribute map.
pub mod claim;
/// Compiled-definition sidecar: modules and the subsort lattice.
pub mod definition;
/// The control-flow graph: nodes, five successor kinds, queries, paths.
pub mod cfg;
/// Structural graph rewrites: edge/split lifting and minimization.
pub mod minimize;
/// One-file-per-node on-disk form of a graph.
pub mod store;
/// JSON-RPC 2.0 client (TCP and HTTP transports) with retry and transcripts.
pub mod rpc;
/// The symbolic execution facade over the backend RPC.
pub mod client;
/// Recorded-transcript backend used by tests and replay debugging.
pub mod replay;
/// Semantics hooks supplied by the driver's embedder.
pub mod semantics;
/// Proof state, status algebra and persistence.
pub mod proof;
/// The all-path reachability provers (plain and bounded).
pub mod prover;
/// Pool-of-executors dispatcher over the steps/commit API.
pub mod parallel;
/// Dependency scheduling across proofs.
pub mod schedule;
/// Bug-report archives: definition, RPC transcript, failing input.
pub mod report;
/// Hashing, short hashes, atomic file writes.
pub mod utils;

pub use cfg::{Cfg, Node, NodeId, Successor};
pub use cterm::{CSubst, CTerm};
pub use proof::{ProofStatus, ReachProof};
pub use prover::ReachProver;
pub use term::{Label, RcTerm, Sort, Term};
