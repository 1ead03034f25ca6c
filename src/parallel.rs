//! Pool-of-executors proving: parallel backend calls, serialized commits.
//!
//! The graphs stay owned by this task; only [`execute_step`] runs on the
//! workers, each of which owns its own backend connection. Work items flow
//! through a bounded queue, results come back through another, and the
//! dispatcher interleaves submitting and draining so neither side can wedge
//! the other. An explored set keeps a node from being dispatched twice, and
//! commits are idempotent by node id, so results may land in any order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::cfg::NodeId;
use crate::client::ExecutionBackend;
use crate::proof::ReachProof;
use crate::prover::{
    execute_step, ExploreStep, Outcome, ProofStep, ProverCore, ProverError, Update,
};

/// Advance several proofs against a pool of `workers` backend connections.
///
/// `cores` maps proof ids to their prover state (options, caches); proofs
/// without an entry are skipped. Returns when every proof has no more
/// dispatchable work.
pub async fn prove_parallel<B, F>(
    proofs: &mut [ReachProof],
    cores: &mut HashMap<String, ProverCore>,
    workers: usize,
    mut make_backend: F,
) -> Result<(), ProverError>
where
    B: ExecutionBackend + 'static,
    F: FnMut() -> B,
{
    if proofs.is_empty() {
        return Ok(());
    }
    let workers = workers.max(1);

    let (work_tx, work_rx) = mpsc::channel::<(String, ExploreStep)>(workers * 2);
    let (result_tx, mut result_rx) = mpsc::channel::<(String, Update)>(workers * 2);
    let work_rx = Arc::new(Mutex::new(work_rx));

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let work_rx = work_rx.clone();
        let result_tx = result_tx.clone();
        let mut backend = make_backend();
        handles.push(tokio::spawn(async move {
            loop {
                let job = { work_rx.lock().await.recv().await };
                let Some((proof_id, step)) = job else { break };
                debug!(worker, proof = %proof_id, node = %step.node_id.shortened(), "executing step");
                let update = execute_step(&mut backend, &step).await;
                if result_tx.send((proof_id, update)).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(result_tx);

    let mut by_id: HashMap<String, usize> = HashMap::new();
    for (index, proof) in proofs.iter().enumerate() {
        by_id.insert(proof.id.clone(), index);
    }

    let mut explored: HashSet<(String, NodeId)> = HashSet::new();
    let mut iterations: HashMap<String, u64> = HashMap::new();
    let mut queue: VecDeque<(String, ExploreStep)> = VecDeque::new();
    let mut in_flight: usize = 0;

    // Drain local marks and collect backend-bound steps for one proof.
    fn refill(
        proof: &mut ReachProof,
        core: &mut ProverCore,
        explored: &mut HashSet<(String, NodeId)>,
        iterations: &mut HashMap<String, u64>,
        queue: &mut VecDeque<(String, ExploreStep)>,
    ) -> Result<(), ProverError> {
        loop {
            if let Some(max) = core.opts().max_iterations {
                if iterations.get(&proof.id).copied().unwrap_or(0) >= max {
                    return Ok(());
                }
            }
            let steps = core.steps(proof);
            let mut marked = false;
            for step in steps {
                match step {
                    ProofStep::Mark { node_id, mark } => {
                        *iterations.entry(proof.id.clone()).or_default() += 1;
                        core.commit(
                            proof,
                            Update {
                                node_id,
                                subsumption_checked: false,
                                outcome: Outcome::Marked(mark),
                            },
                        )?;
                        marked = true;
                        break;
                    }
                    ProofStep::Explore(explore) => {
                        let key = (proof.id.clone(), explore.node_id.clone());
                        if explored.insert(key) {
                            queue.push_back((proof.id.clone(), explore));
                        }
                    }
                }
            }
            if !marked {
                return Ok(());
            }
        }
    }

    for proof in proofs.iter_mut() {
        let Some(core) = cores.get_mut(&proof.id) else { continue };
        refill(proof, core, &mut explored, &mut iterations, &mut queue)?;
    }

    loop {
        if queue.is_empty() && in_flight == 0 {
            break;
        }
        tokio::select! {
            permit = work_tx.reserve(), if !queue.is_empty() => {
                match permit {
                    Ok(permit) => {
                        if let Some(job) = queue.pop_front() {
                            permit.send(job);
                            in_flight += 1;
                        }
                    }
                    Err(_) => break,
                }
            }
            result = result_rx.recv() => {
                let Some((proof_id, update)) = result else { break };
                in_flight -= 1;
                let Some(&index) = by_id.get(&proof_id) else { continue };
                let proof = &mut proofs[index];
                let Some(core) = cores.get_mut(&proof_id) else { continue };

                *iterations.entry(proof_id.clone()).or_default() += 1;
                core.commit(proof, update)?;
                if let Some(dir) = core.opts().save_directory.clone() {
                    proof.write_proof(&dir)?;
                }
                refill(proof, core, &mut explored, &mut iterations, &mut queue)?;
            }
        }
    }

    drop(work_tx);
    for handle in handles {
        let _ = handle.await;
    }

    for proof in proofs.iter() {
        info!(proof = %proof.id, status = %proof.status(), "parallel proving finished");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{Atts, Claim};
    use crate::client::ExecuteResult;
    use crate::cterm::{CSubst, CTerm};
    use crate::proof::ProofStatus;
    use crate::prover::ProverOpts;
    use crate::replay::ReplayBackend;
    use crate::semantics::DefaultSemantics;
    use crate::subst::Subst;
    use crate::term::{bool_token, RcTerm, Term};

    fn claim(label: &str, from: &str, to: &str) -> Claim {
        Claim::new(
            label,
            Term::apply(
                "<top>",
                vec![Term::rewrite(Term::apply(from, vec![]), Term::apply(to, vec![]))],
            ),
            bool_token(true),
            bool_token(true),
            Atts::default(),
        )
    }

    fn state(name: &str) -> CTerm {
        CTerm::from_config(Term::apply("<top>", vec![Term::apply(name, Vec::<RcTerm>::new())]))
    }

    /// Script a two-block chain `from -> mid -> to` for one proof.
    fn script(backend: &mut ReplayBackend, from: &str, mid: &str, to: &str) {
        let init = state(from);
        let middle = state(mid);
        let done = state(to);
        let target = done.clone();
        backend.on_implies(&init, &target, None);
        backend.on_execute(
            &init,
            ExecuteResult::DepthBound { state: middle.clone(), depth: 1, rules: vec![] },
        );
        backend.on_implies(&middle, &target, None);
        backend.on_execute(
            &middle,
            ExecuteResult::DepthBound { state: done.clone(), depth: 1, rules: vec![] },
        );
        backend.on_implies(&done, &target, Some(CSubst::new(Subst::new(), [])));
    }

    #[tokio::test]
    async fn two_proofs_advance_on_a_worker_pool() {
        let mut proofs = vec![
            ReachProof::from_claim(&claim("first", "a0", "a2")).unwrap(),
            ReachProof::from_claim(&claim("second", "b0", "b2")).unwrap(),
        ];
        let mut cores: HashMap<String, ProverCore> = HashMap::new();
        for proof in &proofs {
            cores.insert(
                proof.id.clone(),
                ProverCore::new(Arc::new(DefaultSemantics), ProverOpts::default()),
            );
        }

        // every worker owns a full script for both proofs, so any worker can
        // serve any step
        let make_backend = || {
            let mut backend = ReplayBackend::new().strict();
            script(&mut backend, "a0", "a1", "a2");
            script(&mut backend, "b0", "b1", "b2");
            backend
        };

        prove_parallel(&mut proofs, &mut cores, 3, make_backend).await.unwrap();

        for proof in &proofs {
            assert_eq!(proof.status(), ProofStatus::Passed, "proof {}", proof.id);
            assert_eq!(proof.cfg.edges(None, None).len(), 2);
            assert_eq!(proof.cfg.covers(None, None).len(), 1);
        }
    }

    #[tokio::test]
    async fn duplicate_dispatch_is_suppressed() {
        let mut proofs = vec![ReachProof::from_claim(&claim("only", "c0", "c1")).unwrap()];
        let mut cores: HashMap<String, ProverCore> = HashMap::new();
        cores.insert(
            "only".to_string(),
            ProverCore::new(Arc::new(DefaultSemantics), ProverOpts::default()),
        );

        let make_backend = || {
            let mut backend = ReplayBackend::new().strict();
            let init = state("c0");
            let target = state("c1");
            backend.on_implies(&init, &target, Some(CSubst::new(Subst::new(), [])));
            backend
        };

        prove_parallel(&mut proofs, &mut cores, 2, make_backend).await.unwrap();
        assert_eq!(proofs[0].status(), ProofStatus::Passed);
        assert_eq!(proofs[0].cfg.covers(None, None).len(), 1);
    }
}
