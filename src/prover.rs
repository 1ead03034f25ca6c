//! All-path reachability provers.
//!
//! The loop: take the oldest pending leaf, close it locally if possible
//! (vacuous, bounded, widened), otherwise ask the backend whether it is
//! subsumed by the target (cover) and if not execute it and translate the
//! stop reason into graph structure (edge, split, ndbranch, or a flag).
//!
//! Step discovery is separated from step execution and from commit:
//! [`ProverCore::steps`] is pure over the proof and returns work items,
//! [`execute_step`] performs the backend calls and is the only suspending
//! part, [`ProverCore::commit`] is the only place the graph mutates.
//! [`ReachProver::advance_proof`] strings them together on one task; the
//! dispatcher in [`crate::parallel`] feeds the same functions from a worker
//! pool, and commits are idempotent by node id so completion order does not
//! matter.
//!
//! Failure is local to a step: an aborted execution marks the node stuck,
//! an undecided implication or exhausted transport parks the node as
//! undecided, and the loop moves on.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cfg::{CfgError, NodeId};
use crate::client::{ClientError, ExecuteOpts, ExecuteResult, ExecutionBackend};
use crate::cterm::{CSubst, CTerm};
use crate::proof::{ProofError, ProofStatus, ReachProof};
use crate::rpc::RpcError;
use crate::semantics::Semantics;
use crate::term::{ml_and, RcTerm};

#[derive(Debug, thiserror::Error)]
pub enum ProverError {
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error(transparent)]
    Proof(#[from] ProofError),
}

/// Tuning knobs of one prover run.
#[derive(Debug, Clone, Default)]
pub struct ProverOpts {
    pub max_iterations: Option<u64>,
    pub execute_depth: Option<u64>,
    pub cut_point_rules: Vec<String>,
    pub terminal_rules: Vec<String>,
    /// Module holding proved dependencies as axioms.
    pub dependencies_module: Option<String>,
    /// Module additionally holding the claim itself as a circularity; used
    /// once the node is at nonzero rewrite depth from init.
    pub circularities_module: Option<String>,
    /// Checkpoint the proof here after every commit.
    pub save_directory: Option<PathBuf>,
    /// Simplify the init and target states before exploring.
    pub simplify_init: bool,
}

/// A locally decidable verdict on a node; no backend involved.
#[derive(Debug, Clone)]
pub enum NodeMark {
    /// The node's constraints are syntactically unsatisfiable.
    Vacuous,
    /// The loop bound was reached.
    Bounded,
    /// The semantics declared the state final.
    Terminal,
    /// The node widens to this state; cover it there.
    Abstracted(CTerm),
}

/// What should happen when the subsumption check does not close the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Extend by executing.
    Execute,
    /// The state is semantically final; just record that.
    MarkTerminal,
}

/// A backend-bound work item.
#[derive(Debug, Clone)]
pub struct ExploreStep {
    pub node_id: NodeId,
    pub cterm: CTerm,
    pub target_id: NodeId,
    pub target: CTerm,
    pub opts: ExecuteOpts,
    pub check_subsumption: bool,
    pub fallback: Fallback,
}

/// One unit of undone work on a proof.
#[derive(Debug, Clone)]
pub enum ProofStep {
    /// Decided without the backend; the dispatcher echoes it straight back.
    Mark { node_id: NodeId, mark: NodeMark },
    /// Needs the backend.
    Explore(ExploreStep),
}

impl ProofStep {
    pub fn node_id(&self) -> &NodeId {
        match self {
            ProofStep::Mark { node_id, .. } => node_id,
            ProofStep::Explore(step) => &step.node_id,
        }
    }
}

/// The outcome of one step, ready to be committed.
#[derive(Debug, Clone)]
pub struct Update {
    pub node_id: NodeId,
    /// Whether this step ran (and failed) the subsumption check, so the
    /// check is not repeated if the node resurfaces.
    pub subsumption_checked: bool,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    /// The node is subsumed by the target under this witness.
    Subsumed(CSubst),
    /// Locally decided mark.
    Marked(NodeMark),
    /// The backend executed the node.
    Executed(ExecuteResult),
    /// The backend could not decide the subsumption (code -32003).
    Undecided(String),
    /// The backend aborted; the node is stuck.
    Aborted { unknown_predicate: Option<String> },
    /// Transport or payload failure after retries; park the node.
    Failed(String),
}

/// Run one work item against a backend. This is the workers' entire job;
/// it never touches the graph.
pub async fn execute_step<B: ExecutionBackend>(backend: &mut B, step: &ExploreStep) -> Update {
    let node_id = step.node_id.clone();
    if step.check_subsumption {
        match backend.implies(&step.cterm, &step.target).await {
            Ok(Some(csubst)) => {
                return Update { node_id, subsumption_checked: true, outcome: Outcome::Subsumed(csubst) }
            }
            Ok(None) => {}
            Err(ClientError::Rpc(RpcError::ImplicationFailed(reason))) => {
                return Update {
                    node_id,
                    subsumption_checked: false,
                    outcome: Outcome::Undecided(reason),
                }
            }
            Err(err) => {
                return Update {
                    node_id,
                    subsumption_checked: false,
                    outcome: Outcome::Failed(err.to_string()),
                }
            }
        }
    }

    if step.fallback == Fallback::MarkTerminal {
        return Update {
            node_id,
            subsumption_checked: step.check_subsumption,
            outcome: Outcome::Marked(NodeMark::Terminal),
        };
    }

    match backend.execute(&step.cterm, &step.opts).await {
        Ok(result) => Update {
            node_id,
            subsumption_checked: step.check_subsumption,
            outcome: Outcome::Executed(result),
        },
        Err(ClientError::Aborted { unknown_predicate }) => Update {
            node_id,
            subsumption_checked: step.check_subsumption,
            outcome: Outcome::Aborted { unknown_predicate },
        },
        Err(err) => Update {
            node_id,
            subsumption_checked: step.check_subsumption,
            outcome: Outcome::Failed(err.to_string()),
        },
    }
}

/// Step discovery and commit; owns the caches but never a backend.
pub struct ProverCore {
    semantics: Arc<dyn Semantics>,
    opts: ProverOpts,
    /// Subsumption checks that ran and did not close the node.
    subsumption_failed: BTreeSet<(NodeId, NodeId)>,
    loop_depths: HashMap<NodeId, u64>,
}

impl ProverCore {
    pub fn new(semantics: Arc<dyn Semantics>, opts: ProverOpts) -> Self {
        ProverCore {
            semantics,
            opts,
            subsumption_failed: BTreeSet::new(),
            loop_depths: HashMap::new(),
        }
    }

    pub fn opts(&self) -> &ProverOpts {
        &self.opts
    }

    /// All currently available work, oldest node first. Pure over the
    /// proof: the output only changes through [`ProverCore::commit`].
    pub fn steps(&mut self, proof: &ReachProof) -> Vec<ProofStep> {
        if proof.admitted {
            return Vec::new();
        }
        let mut steps = Vec::new();
        let pending: Vec<(NodeId, CTerm)> =
            proof.pending().into_iter().map(|n| (n.id.clone(), n.cterm.clone())).collect();
        for (node_id, cterm) in pending {
            if cterm.is_bottom() {
                steps.push(ProofStep::Mark { node_id, mark: NodeMark::Vacuous });
                continue;
            }
            if let Some(bound) = proof.bmc_depth {
                if self.loop_depth(proof, &node_id, &cterm) >= bound {
                    steps.push(ProofStep::Mark { node_id, mark: NodeMark::Bounded });
                    continue;
                }
            }
            let widened = self.semantics.abstract_node(&cterm);
            if widened != cterm {
                steps.push(ProofStep::Mark { node_id, mark: NodeMark::Abstracted(widened) });
                continue;
            }

            let target_node = match proof.cfg.get_node(&proof.target) {
                Some(node) => node,
                None => continue,
            };
            let module_name = self.module_for(proof, &node_id);
            let fallback = if self.semantics.is_terminal(&cterm) {
                Fallback::MarkTerminal
            } else {
                Fallback::Execute
            };
            steps.push(ProofStep::Explore(ExploreStep {
                check_subsumption: !self
                    .subsumption_failed
                    .contains(&(node_id.clone(), proof.target.clone())),
                node_id,
                cterm,
                target_id: proof.target.clone(),
                target: target_node.cterm.clone(),
                opts: ExecuteOpts {
                    max_depth: self.opts.execute_depth,
                    cut_point_rules: self.opts.cut_point_rules.clone(),
                    terminal_rules: self.opts.terminal_rules.clone(),
                    module_name,
                },
                fallback,
            }));
        }
        steps
    }

    /// Claims with circularities switch to the circularity module once the
    /// node is at nonzero rewrite depth from init (the circularity may only
    /// be used after progress).
    fn module_for(&self, proof: &ReachProof, node_id: &NodeId) -> Option<String> {
        if let Some(circ) = &self.opts.circularities_module {
            if proof.circularity && !proof.cfg.zero_depth_between(&proof.init, node_id) {
                return Some(circ.clone());
            }
        }
        self.opts.dependencies_module.clone()
    }

    /// Number of prior iterations of this node's loop along its init path.
    fn loop_depth(&mut self, proof: &ReachProof, node_id: &NodeId, cterm: &CTerm) -> u64 {
        if let Some(&depth) = self.loop_depths.get(node_id) {
            return depth;
        }
        let depth = match proof.cfg.shortest_path_between(&proof.init, node_id) {
            None => 0,
            Some(path) => path
                .iter()
                .filter(|succ| {
                    proof
                        .cfg
                        .get_node(succ.source())
                        .map_or(false, |prior| self.semantics.same_loop(&prior.cterm, cterm))
                })
                .count() as u64,
        };
        self.loop_depths.insert(node_id.clone(), depth);
        depth
    }

    /// Apply one update to the proof. Idempotent per node: a node that
    /// already has a successor or verdict absorbs repeated updates without
    /// changing the graph.
    pub fn commit(&mut self, proof: &mut ReachProof, update: Update) -> Result<(), ProverError> {
        let node_id = update.node_id;
        if update.subsumption_checked {
            if !matches!(update.outcome, Outcome::Subsumed(_)) {
                self.subsumption_failed.insert((node_id.clone(), proof.target.clone()));
            }
        }
        if !proof.is_pending(&node_id) || proof.cfg.successor(&node_id).is_some() {
            debug!(node = %node_id.shortened(), "dropping update for settled node");
            return Ok(());
        }

        match update.outcome {
            Outcome::Subsumed(csubst) => {
                info!(node = %node_id.shortened(), "subsumed into target");
                let target = proof.target.clone();
                proof.cfg.create_cover(&node_id, &target, Some(csubst))?;
            }
            Outcome::Marked(NodeMark::Vacuous) => {
                info!(node = %node_id.shortened(), "vacuous node");
                proof.cfg.add_vacuous(&node_id);
            }
            Outcome::Marked(NodeMark::Bounded) => {
                info!(node = %node_id.shortened(), "loop bound reached");
                proof.add_bounded(&node_id);
            }
            Outcome::Marked(NodeMark::Terminal) => {
                info!(node = %node_id.shortened(), "terminal node");
                proof.cfg.add_terminal(&node_id);
            }
            Outcome::Marked(NodeMark::Abstracted(widened)) => {
                info!(node = %node_id.shortened(), "covering into widened state");
                let widened_id = proof.cfg.get_or_create_node(widened).id.clone();
                proof.cfg.create_cover(&node_id, &widened_id, None)?;
            }
            Outcome::Executed(result) => {
                self.commit_extend(proof, &node_id, result)?;
            }
            Outcome::Undecided(reason) => {
                warn!(node = %node_id.shortened(), %reason, "implication undecided");
                proof.add_undecided(&node_id);
                proof.failure_log.push((node_id, format!("implication undecided: {reason}")));
            }
            Outcome::Aborted { unknown_predicate } => {
                warn!(node = %node_id.shortened(), ?unknown_predicate, "backend aborted");
                proof.cfg.add_stuck(&node_id);
                proof.failure_log.push((
                    node_id,
                    match unknown_predicate {
                        Some(pred) => format!("backend aborted on unknown predicate {pred}"),
                        None => "backend aborted".to_string(),
                    },
                ));
            }
            Outcome::Failed(reason) => {
                warn!(node = %node_id.shortened(), %reason, "proof step failed");
                proof.add_undecided(&node_id);
                proof.failure_log.push((node_id, reason));
            }
        }
        Ok(())
    }

    /// Translate one execution result into graph structure.
    fn commit_extend(
        &mut self,
        proof: &mut ReachProof,
        node_id: &NodeId,
        result: ExecuteResult,
    ) -> Result<(), ProverError> {
        proof.cfg.add_expanded(node_id);
        match result {
            ExecuteResult::DepthBound { state, depth, rules } => {
                if depth == 0 {
                    warn!(node = %node_id.shortened(), "no progress at depth bound; node is stuck");
                    proof.cfg.add_stuck(node_id);
                    return Ok(());
                }
                let next = proof.cfg.get_or_create_node(state).id.clone();
                proof.cfg.create_edge(node_id, &next, depth, rules)?;
                debug!(
                    source = %node_id.shortened(),
                    target = %next.shortened(),
                    depth,
                    "basic block"
                );
            }
            ExecuteResult::Stuck { state, depth, rules } => {
                // stuck at depth 0 marks the source; stuck after steps
                // creates the edge and marks the target
                if depth == 0 {
                    proof.cfg.add_stuck(node_id);
                } else {
                    let next = proof.cfg.get_or_create_node(state).id.clone();
                    proof.cfg.create_edge(node_id, &next, depth, rules)?;
                    proof.cfg.add_stuck(&next);
                }
            }
            ExecuteResult::Terminal { state, depth, rule, mut rules } => {
                if depth == 0 {
                    proof.cfg.add_terminal(node_id);
                } else {
                    if rules.last() != Some(&rule) {
                        rules.push(rule);
                    }
                    let next = proof.cfg.get_or_create_node(state).id.clone();
                    proof.cfg.create_edge(node_id, &next, depth, rules)?;
                    proof.cfg.add_terminal(&next);
                }
            }
            ExecuteResult::CutPoint { state, depth, rule, next_states, rules } => {
                let base = self.edge_to(proof, node_id, state, depth, rules)?;
                if proof.cfg.successor(&base).is_some() {
                    return Ok(());
                }
                let targets: Vec<NodeId> = next_states
                    .into_iter()
                    .map(|s| proof.cfg.get_or_create_node(s).id.clone())
                    .collect();
                match targets.as_slice() {
                    [] => {
                        proof.cfg.add_stuck(&base);
                    }
                    [only] => {
                        proof.cfg.create_edge(&base, only, 1, vec![rule])?;
                    }
                    _ => {
                        proof.cfg.create_ndbranch(&base, targets, vec![rule])?;
                    }
                }
            }
            ExecuteResult::Branching { state, depth, next_states, rules } => {
                let base = self.edge_to(proof, node_id, state.clone(), depth, rules)?;
                if proof.cfg.successor(&base).is_some() {
                    return Ok(());
                }
                if next_states.is_empty() {
                    proof.cfg.add_stuck(&base);
                    return Ok(());
                }
                match branch_conditions(&*self.semantics, &state, &next_states) {
                    Some(conditions) => {
                        debug!(
                            node = %base.shortened(),
                            branches = conditions.len(),
                            "case split"
                        );
                        proof.cfg.split_on_constraints(&base, conditions)?;
                    }
                    None => {
                        debug!(
                            node = %base.shortened(),
                            branches = next_states.len(),
                            "nondeterministic branch"
                        );
                        let targets: Vec<NodeId> = next_states
                            .into_iter()
                            .map(|s| proof.cfg.get_or_create_node(s).id.clone())
                            .collect();
                        proof.cfg.create_ndbranch(&base, targets, Vec::new())?;
                    }
                }
            }
            ExecuteResult::Vacuous { .. } => {
                proof.cfg.add_vacuous(node_id);
            }
        }
        Ok(())
    }

    /// Create the basic-block edge for a positive depth, or stay in place.
    fn edge_to(
        &mut self,
        proof: &mut ReachProof,
        node_id: &NodeId,
        state: CTerm,
        depth: u64,
        rules: Vec<String>,
    ) -> Result<NodeId, ProverError> {
        if depth == 0 {
            return Ok(node_id.clone());
        }
        let next = proof.cfg.get_or_create_node(state).id.clone();
        proof.cfg.create_edge(node_id, &next, depth, rules)?;
        Ok(next)
    }
}

/// Find per-branch conditions: either the semantics reads them off the
/// state, or each next state carries fresh constraints over the base
/// state's. `None` means the branches are indistinguishable by constraints
/// and the caller must record a nondeterministic branch.
fn branch_conditions(
    semantics: &dyn Semantics,
    state: &CTerm,
    next_states: &[CTerm],
) -> Option<Vec<RcTerm>> {
    let extracted = semantics.extract_branches(state);
    if !extracted.is_empty() && extracted.len() == next_states.len() {
        return Some(extracted);
    }

    let base: BTreeSet<String> =
        state.constraints().iter().map(|c| c.canonical_json()).collect();
    let mut diffs: Vec<RcTerm> = Vec::with_capacity(next_states.len());
    for next in next_states {
        let fresh: Vec<RcTerm> = next
            .constraints()
            .iter()
            .filter(|c| !base.contains(&c.canonical_json()))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return None;
        }
        diffs.push(ml_and(fresh));
    }
    let distinct: BTreeSet<String> = diffs.iter().map(|d| d.canonical_json()).collect();
    if distinct.len() != diffs.len() {
        return None;
    }
    Some(diffs)
}

/// Replace a proof's init and target nodes with their simplified forms.
///
/// A failed simplification is logged and skipped; the unsimplified state is
/// still correct, just larger.
pub async fn simplify_endpoints<B: ExecutionBackend>(
    backend: &mut B,
    proof: &mut ReachProof,
) -> Result<(), ProverError> {
    for is_init in [true, false] {
        let node_id = if is_init { proof.init.clone() } else { proof.target.clone() };
        let Some(cterm) = proof.cfg.get_node(&node_id).map(|n| n.cterm.clone()) else {
            continue;
        };
        let simplified = match backend.simplify(&cterm).await {
            Ok((simplified, _logs)) => simplified,
            Err(err) => {
                warn!(node = %node_id.shortened(), %err, "could not simplify endpoint");
                continue;
            }
        };
        if simplified == cterm {
            continue;
        }
        let new_id = proof.cfg.replace_node(node_id.as_str(), simplified)?;
        if is_init {
            proof.init = new_id;
        } else {
            proof.target = new_id;
        }
    }
    Ok(())
}

/// The single-task prover: one backend, one proof at a time.
pub struct ReachProver<B: ExecutionBackend> {
    backend: B,
    core: ProverCore,
}

impl<B: ExecutionBackend> ReachProver<B> {
    pub fn new(backend: B, semantics: Arc<dyn Semantics>, opts: ProverOpts) -> Self {
        ReachProver { backend, core: ProverCore::new(semantics, opts) }
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn core_mut(&mut self) -> &mut ProverCore {
        &mut self.core
    }

    /// Drive the proof until nothing is pending or the iteration bound is
    /// hit. Returns the resulting status.
    pub async fn advance_proof(&mut self, proof: &mut ReachProof) -> Result<ProofStatus, ProverError> {
        if self.core.opts.simplify_init && !proof.admitted {
            simplify_endpoints(&mut self.backend, proof).await?;
        }
        let mut iterations: u64 = 0;
        loop {
            if let Some(max) = self.core.opts.max_iterations {
                if iterations >= max {
                    warn!(proof = %proof.id, max, "reached iteration bound");
                    break;
                }
            }
            let Some(step) = self.core.steps(proof).into_iter().next() else {
                break;
            };
            iterations += 1;
            info!(
                proof = %proof.id,
                node = %step.node_id().shortened(),
                iteration = iterations,
                "advancing"
            );

            let update = match step {
                ProofStep::Mark { node_id, mark } => {
                    Update { node_id, subsumption_checked: false, outcome: Outcome::Marked(mark) }
                }
                ProofStep::Explore(explore) => execute_step(&mut self.backend, &explore).await,
            };
            self.core.commit(proof, update)?;

            if let Some(dir) = self.core.opts.save_directory.clone() {
                proof.write_proof(&dir)?;
            }
        }
        if let Some(dir) = self.core.opts.save_directory.clone() {
            proof.write_proof(&dir)?;
        }
        Ok(proof.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{Atts, Claim};
    use crate::client::GetModelResult;
    use crate::replay::ReplayBackend;
    use crate::semantics::DefaultSemantics;
    use crate::subst::Subst;
    use crate::term::{
        bool_token, flatten_and, int_token, ml_equals, ml_equals_true, ml_not, Term,
    };

    fn config(inner: RcTerm) -> RcTerm {
        Term::apply("<top>", vec![inner])
    }

    fn claim_between(lhs: RcTerm, rhs: RcTerm) -> Claim {
        Claim::new(
            "spec",
            Term::apply("<top>", vec![Term::rewrite(lhs, rhs)]),
            bool_token(true),
            bool_token(true),
            Atts::default(),
        )
    }

    fn witness() -> CSubst {
        CSubst::new(Subst::new(), [])
    }

    async fn run(
        backend: ReplayBackend,
        proof: &mut ReachProof,
        opts: ProverOpts,
    ) -> ProofStatus {
        let mut prover = ReachProver::new(backend, Arc::new(DefaultSemantics), opts);
        prover.advance_proof(proof).await.unwrap()
    }

    #[tokio::test]
    async fn straight_line_proof_passes() {
        // run(N) => done(N), reached in two basic blocks of depth 3 + 2
        let claim = claim_between(
            Term::apply("run", vec![Term::var("N")]),
            Term::apply("done", vec![Term::var("N")]),
        );
        let mut proof = ReachProof::from_claim(&claim).unwrap();
        let init = proof.cfg.get_node(&proof.init).unwrap().cterm.clone();
        let target = proof.cfg.get_node(&proof.target).unwrap().cterm.clone();

        let mid = CTerm::from_config(config(Term::apply("step", vec![Term::var("N")])));
        let done = CTerm::from_config(config(Term::apply("done", vec![Term::var("N")])));

        let mut backend = ReplayBackend::new().strict();
        backend.on_implies(&init, &target, None);
        backend.on_execute(
            &init,
            ExecuteResult::DepthBound { state: mid.clone(), depth: 3, rules: vec!["r1".into()] },
        );
        backend.on_implies(&mid, &target, None);
        backend.on_execute(
            &mid,
            ExecuteResult::DepthBound { state: done.clone(), depth: 2, rules: vec!["r2".into()] },
        );
        backend.on_implies(&done, &target, Some(witness()));

        let status = run(backend, &mut proof, ProverOpts::default()).await;
        assert_eq!(status, ProofStatus::Passed);

        // one chain init -> mid -> done, one cover into target
        let mid_id = crate::cfg::NodeId::of(&mid);
        let done_id = crate::cfg::NodeId::of(&done);
        assert_eq!(proof.cfg.edge(&proof.init).unwrap().target, mid_id);
        assert_eq!(proof.cfg.edge(&mid_id).unwrap().target, done_id);
        assert_eq!(proof.cfg.covers(Some(&done_id), Some(&proof.target)).len(), 1);
        let total_depth: u64 =
            proof.cfg.edges(None, None).iter().map(|e| e.depth).sum();
        assert_eq!(total_depth, 5);
    }

    #[tokio::test]
    async fn branching_proof_splits_and_passes() {
        // if b then x:=1 else x:=2  =>  done
        let claim = claim_between(Term::apply("branch", vec![]), Term::apply("done", vec![]));
        let mut proof = ReachProof::from_claim(&claim).unwrap();
        let init = proof.cfg.get_node(&proof.init).unwrap().cterm.clone();
        let target = proof.cfg.get_node(&proof.target).unwrap().cterm.clone();

        let b_true = ml_equals_true(Term::var("B"));
        let b_false = ml_equals_true(ml_not(Term::var("B")));
        let then_branch = init.add_constraint(b_true.clone());
        let else_branch = init.add_constraint(b_false.clone());
        let x1 = CTerm::new(config(Term::apply("assigned", vec![int_token(1)])), [b_true.clone()]);
        let x2 = CTerm::new(config(Term::apply("assigned", vec![int_token(2)])), [b_false.clone()]);

        let mut backend = ReplayBackend::new().strict();
        backend.on_implies(&init, &target, None);
        backend.on_execute(
            &init,
            ExecuteResult::Branching {
                state: init.clone(),
                depth: 0,
                next_states: vec![then_branch.clone(), else_branch.clone()],
                rules: vec![],
            },
        );
        backend.on_implies(&then_branch, &target, None);
        backend.on_execute(
            &then_branch,
            ExecuteResult::DepthBound { state: x1.clone(), depth: 1, rules: vec!["then".into()] },
        );
        backend.on_implies(&else_branch, &target, None);
        backend.on_execute(
            &else_branch,
            ExecuteResult::DepthBound { state: x2.clone(), depth: 1, rules: vec!["else".into()] },
        );
        backend.on_implies(&x1, &target, Some(witness()));
        backend.on_implies(&x2, &target, Some(witness()));

        let status = run(backend, &mut proof, ProverOpts::default()).await;
        assert_eq!(status, ProofStatus::Passed);

        let splits = proof.cfg.splits(Some(&proof.init), None);
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].targets.len(), 2);
        // both branch leaves are covered into the target
        assert_eq!(proof.cfg.covers(None, Some(&proof.target)).len(), 2);
    }

    #[tokio::test]
    async fn failing_branch_reports_path_constraints() {
        // same split, but the claim insists x = 1; the else branch gets stuck
        let claim = claim_between(Term::apply("branch", vec![]), Term::apply("one", vec![]));
        let mut proof = ReachProof::from_claim(&claim).unwrap();
        let init = proof.cfg.get_node(&proof.init).unwrap().cterm.clone();
        let target = proof.cfg.get_node(&proof.target).unwrap().cterm.clone();

        let b_true = ml_equals_true(Term::var("B"));
        let b_false = ml_equals_true(ml_not(Term::var("B")));
        let then_branch = init.add_constraint(b_true.clone());
        let else_branch = init.add_constraint(b_false.clone());

        let mut backend = ReplayBackend::new().strict();
        backend.on_implies(&init, &target, None);
        backend.on_execute(
            &init,
            ExecuteResult::Branching {
                state: init.clone(),
                depth: 0,
                next_states: vec![then_branch.clone(), else_branch.clone()],
                rules: vec![],
            },
        );
        backend.on_implies(&then_branch, &target, Some(witness()));
        backend.on_implies(&else_branch, &target, None);
        backend.on_execute(
            &else_branch,
            ExecuteResult::Stuck { state: else_branch.clone(), depth: 0, rules: vec![] },
        );

        let status = run(backend, &mut proof, ProverOpts::default()).await;
        assert_eq!(status, ProofStatus::Failed);

        let failing = proof.failing();
        assert_eq!(failing.len(), 1);
        let stuck_id = failing[0].id.clone();
        assert!(proof.cfg.is_stuck(&stuck_id));

        let constraint = proof.cfg.path_constraints(stuck_id.as_str()).unwrap();
        assert_eq!(flatten_and(&constraint), vec![b_false]);
    }

    #[tokio::test]
    async fn loop_closes_with_cover_into_widened_head() {
        // while (n > 0) n := n - 1  =>  exit, widening each body state back
        // to the loop head
        struct LoopSemantics {
            head: CTerm,
        }
        impl Semantics for LoopSemantics {
            fn abstract_node(&self, cterm: &CTerm) -> CTerm {
                let is_body = cterm
                    .cell("loop")
                    .map_or(false, |t| matches!(t.as_ref(), Term::App { label, .. } if label.name == "_-Int_"));
                if is_body {
                    self.head.clone()
                } else {
                    cterm.clone()
                }
            }
        }

        let claim = claim_between(
            Term::apply("loop", vec![Term::var("N")]),
            Term::apply("exit", vec![]),
        );
        let mut proof = ReachProof::from_claim(&claim).unwrap();
        let head = proof.cfg.get_node(&proof.init).unwrap().cterm.clone();
        let target = proof.cfg.get_node(&proof.target).unwrap().cterm.clone();

        let n_pos = ml_equals_true(Term::apply("_>Int_", vec![Term::var("N"), int_token(0)]));
        let n_done = ml_equals_true(Term::apply("_<=Int_", vec![Term::var("N"), int_token(0)]));
        let enter = head.add_constraint(n_pos.clone());
        let leave = head.add_constraint(n_done.clone());
        let body = CTerm::new(
            config(Term::apply(
                "loop",
                vec![Term::apply("_-Int_", vec![Term::var("N"), int_token(1)])],
            )),
            [n_pos.clone()],
        );

        let mut backend = ReplayBackend::new().strict();
        backend.on_implies(&head, &target, None);
        backend.on_execute(
            &head,
            ExecuteResult::Branching {
                state: head.clone(),
                depth: 0,
                next_states: vec![enter.clone(), leave.clone()],
                rules: vec![],
            },
        );
        backend.on_implies(&leave, &target, Some(witness()));
        backend.on_implies(&enter, &target, None);
        backend.on_execute(
            &enter,
            ExecuteResult::DepthBound { state: body.clone(), depth: 2, rules: vec!["body".into()] },
        );

        let semantics = Arc::new(LoopSemantics { head: head.clone() });
        let mut prover =
            ReachProver::new(backend, semantics, ProverOpts::default());
        let status = prover.advance_proof(&mut proof).await.unwrap();
        assert_eq!(status, ProofStatus::Passed);

        // the body state covers back into the loop head, closing the cycle
        let body_id = crate::cfg::NodeId::of(&body);
        let covers = proof.cfg.covers(Some(&body_id), Some(&proof.init));
        assert_eq!(covers.len(), 1);
        // the cover witness instantiates N to N - 1
        let witness_subst = &covers[0].csubst.subst;
        assert_eq!(
            witness_subst.get("N"),
            Some(&Term::apply("_-Int_", vec![Term::var("N"), int_token(1)]))
        );
    }

    #[tokio::test]
    async fn bmc_bounds_symbolic_loops() {
        struct SameLoop;
        impl Semantics for SameLoop {
            fn same_loop(&self, a: &CTerm, b: &CTerm) -> bool {
                a.cell("loop").is_some() && b.cell("loop").is_some()
            }
        }

        let claim = claim_between(
            Term::apply("loop", vec![Term::var("N")]),
            Term::apply("exit", vec![]),
        );
        let mut proof = ReachProof::from_claim(&claim).unwrap().with_bmc_depth(Some(2));
        let head = proof.cfg.get_node(&proof.init).unwrap().cterm.clone();
        let target = proof.cfg.get_node(&proof.target).unwrap().cterm.clone();

        let n_pos = ml_equals_true(Term::apply("_>Int_", vec![Term::var("N"), int_token(0)]));
        let n_done = ml_equals_true(Term::apply("_<=Int_", vec![Term::var("N"), int_token(0)]));
        let enter = head.add_constraint(n_pos.clone());
        let leave = head.add_constraint(n_done.clone());
        let unrolled = CTerm::new(
            config(Term::apply(
                "loop",
                vec![Term::apply("_-Int_", vec![Term::var("N"), int_token(1)])],
            )),
            [n_pos.clone()],
        );

        let mut backend = ReplayBackend::new().strict();
        backend.on_implies(&head, &target, None);
        backend.on_execute(
            &head,
            ExecuteResult::Branching {
                state: head.clone(),
                depth: 0,
                next_states: vec![enter.clone(), leave.clone()],
                rules: vec![],
            },
        );
        backend.on_implies(&leave, &target, Some(witness()));
        backend.on_implies(&enter, &target, None);
        backend.on_execute(
            &enter,
            ExecuteResult::DepthBound { state: unrolled.clone(), depth: 2, rules: vec![] },
        );

        let mut prover = ReachProver::new(backend, Arc::new(SameLoop), ProverOpts::default());
        let status = prover.advance_proof(&mut proof).await.unwrap();

        // the unrolled state hits the bound: head and the entry branch are
        // two iterations of the same loop on its path
        assert_eq!(status, ProofStatus::Failed);
        let unrolled_id = crate::cfg::NodeId::of(&unrolled);
        assert!(proof.is_bounded(&unrolled_id));
        // the exit branch still proved
        assert_eq!(proof.cfg.covers(None, Some(&proof.target)).len(), 1);
    }

    #[tokio::test]
    async fn cut_point_produces_ndbranch_and_both_sides_prove() {
        let claim = claim_between(Term::apply("start", vec![]), Term::apply("done", vec![]));
        let mut proof = ReachProof::from_claim(&claim).unwrap();
        let init = proof.cfg.get_node(&proof.init).unwrap().cterm.clone();
        let target = proof.cfg.get_node(&proof.target).unwrap().cterm.clone();

        let site = CTerm::from_config(config(Term::apply("choice", vec![])));
        let left = CTerm::from_config(config(Term::apply("left", vec![])));
        let right = CTerm::from_config(config(Term::apply("right", vec![])));

        let mut backend = ReplayBackend::new().strict();
        backend.on_implies(&init, &target, None);
        backend.on_execute(
            &init,
            ExecuteResult::CutPoint {
                state: site.clone(),
                depth: 2,
                rule: "pick".into(),
                next_states: vec![left.clone(), right.clone()],
                rules: vec!["walk".into()],
            },
        );
        backend.on_implies(&left, &target, Some(witness()));
        backend.on_implies(&right, &target, Some(witness()));

        let status = run(
            backend,
            &mut proof,
            ProverOpts { cut_point_rules: vec!["pick".into()], ..Default::default() },
        )
        .await;
        assert_eq!(status, ProofStatus::Passed);

        let site_id = crate::cfg::NodeId::of(&site);
        let branches = proof.cfg.ndbranches(Some(&site_id), None);
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].rules, vec!["pick"]);
        assert_eq!(branches[0].targets.len(), 2);
        assert_eq!(proof.cfg.covers(None, Some(&proof.target)).len(), 2);
    }

    #[tokio::test]
    async fn undecided_implication_parks_the_node() {
        let claim = claim_between(Term::apply("start", vec![]), Term::apply("done", vec![]));
        let mut proof = ReachProof::from_claim(&claim).unwrap();
        let init = proof.cfg.get_node(&proof.init).unwrap().cterm.clone();
        let target = proof.cfg.get_node(&proof.target).unwrap().cterm.clone();

        let mut backend = ReplayBackend::new().strict();
        backend.on_implies_undecided(&init, &target, "smt gave up");

        let status = run(backend, &mut proof, ProverOpts::default()).await;
        assert_eq!(status, ProofStatus::Pending);
        assert!(proof.is_undecided(&proof.init.clone()));
        assert!(proof.failing().is_empty());
        assert!(!proof.failure_log.is_empty());
    }

    #[tokio::test]
    async fn aborted_execution_marks_the_node_stuck() {
        let claim = claim_between(Term::apply("start", vec![]), Term::apply("done", vec![]));
        let mut proof = ReachProof::from_claim(&claim).unwrap();
        let init = proof.cfg.get_node(&proof.init).unwrap().cterm.clone();
        let target = proof.cfg.get_node(&proof.target).unwrap().cterm.clone();

        struct AbortingBackend {
            inner: ReplayBackend,
        }
        impl ExecutionBackend for AbortingBackend {
            async fn execute(
                &mut self,
                _cterm: &CTerm,
                _opts: &ExecuteOpts,
            ) -> Result<ExecuteResult, ClientError> {
                Err(ClientError::Aborted { unknown_predicate: Some("f(X)".into()) })
            }
            async fn simplify(
                &mut self,
                cterm: &CTerm,
            ) -> Result<(CTerm, Vec<crate::client::LogEntry>), ClientError> {
                self.inner.simplify(cterm).await
            }
            async fn implies(
                &mut self,
                antecedent: &CTerm,
                consequent: &CTerm,
            ) -> Result<Option<CSubst>, ClientError> {
                self.inner.implies(antecedent, consequent).await
            }
            async fn get_model(
                &mut self,
                cterm: &CTerm,
                module_name: Option<&str>,
            ) -> Result<GetModelResult, ClientError> {
                self.inner.get_model(cterm, module_name).await
            }
            async fn add_module(
                &mut self,
                name: &str,
                axioms: Vec<serde_json::Value>,
            ) -> Result<(), ClientError> {
                self.inner.add_module(name, axioms).await
            }
        }

        let mut inner = ReplayBackend::new().strict();
        inner.on_implies(&init, &target, None);
        let backend = AbortingBackend { inner };

        let mut prover =
            ReachProver::new(backend, Arc::new(DefaultSemantics), ProverOpts::default());
        let status = prover.advance_proof(&mut proof).await.unwrap();
        assert_eq!(status, ProofStatus::Failed);
        assert!(proof.cfg.is_stuck(&proof.init));
    }

    #[tokio::test]
    async fn iteration_bound_leaves_proof_pending() {
        let claim = claim_between(Term::apply("a0", vec![]), Term::apply("done", vec![]));
        let mut proof = ReachProof::from_claim(&claim).unwrap();
        let init = proof.cfg.get_node(&proof.init).unwrap().cterm.clone();
        let target = proof.cfg.get_node(&proof.target).unwrap().cterm.clone();

        // an endless chain a0 -> a1 -> a2 -> ...
        let mut backend = ReplayBackend::new().strict();
        let mut current = init;
        for i in 1..10 {
            let next = CTerm::from_config(config(Term::apply(format!("a{i}"), vec![])));
            backend.on_implies(&current, &target, None);
            backend.on_execute(
                &current,
                ExecuteResult::DepthBound { state: next.clone(), depth: 1, rules: vec![] },
            );
            current = next;
        }

        let status = run(
            backend,
            &mut proof,
            ProverOpts { max_iterations: Some(3), ..Default::default() },
        )
        .await;
        assert_eq!(status, ProofStatus::Pending);
        assert_eq!(proof.cfg.edges(None, None).len(), 3);
    }

    #[tokio::test]
    async fn simplify_init_replaces_endpoints() {
        let claim = claim_between(
            Term::apply("messy", vec![Term::apply("id", vec![Term::var("N")])]),
            Term::apply("done", vec![]),
        );
        let mut proof = ReachProof::from_claim(&claim).unwrap();
        let init = proof.cfg.get_node(&proof.init).unwrap().cterm.clone();
        let target = proof.cfg.get_node(&proof.target).unwrap().cterm.clone();

        let tidy = CTerm::from_config(config(Term::apply("messy", vec![Term::var("N")])));

        let mut backend = ReplayBackend::new();
        backend.on_simplify(&init, tidy.clone());
        backend.on_implies(&tidy, &target, Some(witness()));

        let status = run(
            backend,
            &mut proof,
            ProverOpts { simplify_init: true, ..Default::default() },
        )
        .await;
        assert_eq!(status, ProofStatus::Passed);
        assert_eq!(proof.init, crate::cfg::NodeId::of(&tidy));
        assert!(proof.cfg.get_node_by_cterm(&init).is_none());
    }

    #[tokio::test]
    async fn vacuous_nodes_close_without_backend() {
        let claim = claim_between(Term::apply("start", vec![]), Term::apply("done", vec![]));
        let mut proof = ReachProof::from_claim(&claim).unwrap();
        let init = proof.cfg.get_node(&proof.init).unwrap().cterm.clone();
        let target = proof.cfg.get_node(&proof.target).unwrap().cterm.clone();

        let feasible = CTerm::from_config(config(Term::apply("go", vec![])));
        let infeasible = feasible.add_constraint(crate::term::ml_bottom());

        let mut backend = ReplayBackend::new().strict();
        backend.on_implies(&init, &target, None);
        backend.on_execute(
            &init,
            ExecuteResult::Branching {
                state: init.clone(),
                depth: 0,
                next_states: vec![
                    feasible.add_constraint(ml_equals(Term::var("X"), int_token(1))),
                    infeasible.clone(),
                ],
                rules: vec![],
            },
        );
        let feasible_branch = init.add_constraint(ml_equals(Term::var("X"), int_token(1)));
        backend.on_implies(&feasible_branch, &target, Some(witness()));

        let status = run(backend, &mut proof, ProverOpts::default()).await;
        assert_eq!(status, ProofStatus::Passed);
        // one branch was vacuous and never reached the backend
        let vacuous: Vec<_> =
            proof.cfg.nodes().filter(|n| proof.cfg.is_vacuous(&n.id)).collect();
        assert_eq!(vacuous.len(), 1);
    }
}
