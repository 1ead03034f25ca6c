//! Scheduling proofs across their dependency DAG.
//!
//! Claims may cite other claims as lemmas (`depends`). The schedule builds
//! the proofs for the selected claims plus their transitive dependencies,
//! orders them topologically (a cycle is a user error, reported with one of
//! its back edges), and runs them level by level: once a level's proofs all
//! pass, they are installed on the backend as an ephemeral axiom module so
//! dependent proofs can use them. A claim marked `circularity` additionally
//! gets a module containing itself, which the prover only selects once a
//! node has made real rewrite progress.
//!
//! A failed dependency is not fatal to the schedule: its dependents are
//! skipped (left pending) and everything else still runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::cfg::CfgError;
use crate::claim::ClaimSet;
use crate::client::{ClientError, ExecutionBackend};
use crate::parallel::prove_parallel;
use crate::proof::{ProofStatus, ReachProof};
use crate::prover::{ProverCore, ProverError, ProverOpts};
use crate::semantics::Semantics;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("proof schedule has a cycle from {from} to {to}")]
    Cycle { from: String, to: String },
    #[error("claim `{dependent}` depends on unknown claim `{missing}`")]
    UnknownClaim { dependent: String, missing: String },
    #[error("no claim named `{0}` in the claims file")]
    NoSuchClaim(String),
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error(transparent)]
    Prover(#[from] ProverError),
    #[error("cannot install dependency module: {0}")]
    Client(#[from] ClientError),
}

/// The dependency-ordered set of proofs for one driver run.
#[derive(Debug)]
pub struct ProofSchedule {
    /// Proofs by claim label.
    proofs: BTreeMap<String, ReachProof>,
    /// Claim payloads by label, for axiom installation.
    axioms: BTreeMap<String, Value>,
    /// Dependency edges `(dep, dependent)`.
    edges: Vec<(String, String)>,
    /// Labels in topological order (dependencies first).
    order: Vec<String>,
}

impl ProofSchedule {
    /// Build the schedule for `selected` claims (all claims when `None`),
    /// pulling in transitive dependencies.
    pub fn from_claims(
        claims: &ClaimSet,
        selected: Option<&[String]>,
        bmc_depth: Option<u64>,
    ) -> Result<ProofSchedule, ScheduleError> {
        let mut wanted: Vec<String> = match selected {
            None => claims.labels(),
            Some(labels) => {
                for label in labels {
                    if claims.get(label).is_none() {
                        return Err(ScheduleError::NoSuchClaim(label.clone()));
                    }
                }
                labels.to_vec()
            }
        };

        let mut proofs: BTreeMap<String, ReachProof> = BTreeMap::new();
        let mut axioms: BTreeMap<String, Value> = BTreeMap::new();
        let mut edges: Vec<(String, String)> = Vec::new();

        while let Some(label) = wanted.pop() {
            if proofs.contains_key(&label) {
                continue;
            }
            let claim = claims
                .get(&label)
                .ok_or_else(|| ScheduleError::NoSuchClaim(label.clone()))?;
            let proof = ReachProof::from_claim(claim)?.with_bmc_depth(bmc_depth);
            for dep in claim.depends() {
                if claims.get(&dep).is_none() {
                    return Err(ScheduleError::UnknownClaim {
                        dependent: label.clone(),
                        missing: dep,
                    });
                }
                edges.push((dep.clone(), label.clone()));
                wanted.push(dep);
            }
            axioms.insert(label.clone(), claim.to_value());
            proofs.insert(label, proof);
        }

        let order = topological_order(proofs.keys().cloned().collect(), &edges)?;
        Ok(ProofSchedule { proofs, axioms, edges, order })
    }

    /// Labels in dependency order.
    pub fn proof_ids(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, label: &str) -> Option<&ReachProof> {
        self.proofs.get(label)
    }

    pub fn proofs(&self) -> impl Iterator<Item = &ReachProof> {
        self.order.iter().filter_map(|label| self.proofs.get(label))
    }

    fn dependencies_of(&self, label: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, dependent)| dependent == label)
            .map(|(dep, _)| dep.as_str())
            .collect()
    }

    /// Aggregate verdict: any failure fails the run, anything unfinished
    /// keeps it pending.
    pub fn overall_status(&self) -> ProofStatus {
        let mut status = ProofStatus::Passed;
        for proof in self.proofs.values() {
            match proof.status() {
                ProofStatus::Failed => return ProofStatus::Failed,
                ProofStatus::Pending => status = ProofStatus::Pending,
                ProofStatus::Passed => {}
            }
        }
        status
    }

    /// Run every proof, dependencies first, parallelizing within a level.
    ///
    /// `make_backend` supplies one connection per worker plus one used to
    /// install axiom modules (module installation is server-global).
    pub async fn run<B, F>(
        &mut self,
        semantics: Arc<dyn Semantics>,
        opts: &ProverOpts,
        workers: usize,
        mut make_backend: F,
    ) -> Result<ProofStatus, ScheduleError>
    where
        B: ExecutionBackend + 'static,
        F: FnMut() -> B,
    {
        let mut finished: BTreeMap<String, ProofStatus> = BTreeMap::new();

        loop {
            // skip proofs whose dependencies can no longer all pass
            for label in self.order.clone() {
                if finished.contains_key(&label) {
                    continue;
                }
                let blocked = self.dependencies_of(&label).into_iter().any(|dep| {
                    matches!(
                        finished.get(dep),
                        Some(ProofStatus::Failed) | Some(ProofStatus::Pending)
                    )
                });
                if blocked {
                    warn!(proof = %label, "skipping proof with unproved dependencies");
                    let status =
                        self.proofs.get(&label).map_or(ProofStatus::Pending, ReachProof::status);
                    finished.insert(label, status);
                }
            }

            let ready: Vec<String> = self
                .order
                .iter()
                .filter(|label| !finished.contains_key(*label))
                .filter(|label| {
                    self.dependencies_of(label)
                        .into_iter()
                        .all(|dep| finished.get(dep) == Some(&ProofStatus::Passed))
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }

            // install dependency and circularity modules once per level
            let mut setup = make_backend();
            let mut cores: HashMap<String, ProverCore> = HashMap::new();
            for label in &ready {
                if opts.simplify_init && !self.proofs[label].admitted {
                    if let Some(proof) = self.proofs.get_mut(label) {
                        crate::prover::simplify_endpoints(&mut setup, proof).await?;
                    }
                }
                let proof = &self.proofs[label];
                if proof.admitted {
                    cores.insert(label.clone(), ProverCore::new(semantics.clone(), opts.clone()));
                    continue;
                }
                let mut proof_opts = opts.clone();
                let dep_axioms: Vec<Value> = self
                    .dependencies_of(label)
                    .into_iter()
                    .filter_map(|dep| self.axioms.get(dep))
                    .cloned()
                    .collect();
                if !dep_axioms.is_empty() {
                    let module = format!("{label}-DEPENDS");
                    setup.add_module(&module, dep_axioms.clone()).await?;
                    proof_opts.dependencies_module = Some(module);
                }
                if proof.circularity {
                    let module = format!("{label}-CIRCULARITIES");
                    let mut circ_axioms = dep_axioms;
                    if let Some(own) = self.axioms.get(label) {
                        circ_axioms.push(own.clone());
                    }
                    setup.add_module(&module, circ_axioms).await?;
                    proof_opts.circularities_module = Some(module);
                }
                cores.insert(label.clone(), ProverCore::new(semantics.clone(), proof_opts));
            }

            info!(level = ?ready, "running proof level");
            let mut batch: Vec<ReachProof> = ready
                .iter()
                .filter_map(|label| self.proofs.remove(label))
                .collect();
            let result = prove_parallel(&mut batch, &mut cores, workers, &mut make_backend).await;
            for proof in batch {
                finished.insert(proof.id.clone(), proof.status());
                self.proofs.insert(proof.id.clone(), proof);
            }
            result?;
        }

        Ok(self.overall_status())
    }
}

/// Kahn's algorithm; on a cycle, report one remaining edge.
fn topological_order(
    labels: BTreeSet<String>,
    edges: &[(String, String)],
) -> Result<Vec<String>, ScheduleError> {
    let edges: BTreeSet<(String, String)> = edges
        .iter()
        .filter(|(dep, dependent)| labels.contains(dep) && labels.contains(dependent))
        .cloned()
        .collect();

    let mut in_degree: BTreeMap<&str, usize> = labels.iter().map(|l| (l.as_str(), 0)).collect();
    for (_, dependent) in &edges {
        if let Some(count) = in_degree.get_mut(dependent.as_str()) {
            *count += 1;
        }
    }

    let mut order: Vec<String> = Vec::with_capacity(labels.len());
    let mut ready: Vec<&str> =
        in_degree.iter().filter(|(_, &d)| d == 0).map(|(l, _)| *l).collect();
    let mut placed: BTreeSet<&str> = BTreeSet::new();

    while let Some(label) = ready.pop() {
        if !placed.insert(label) {
            continue;
        }
        order.push(label.to_string());
        for (dep, dependent) in &edges {
            if dep == label {
                if let Some(count) = in_degree.get_mut(dependent.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(dependent);
                    }
                }
            }
        }
    }

    if order.len() != labels.len() {
        let (from, to) = edges
            .iter()
            .find(|(dep, _)| !placed.contains(dep.as_str()))
            .cloned()
            .unwrap_or_else(|| ("?".to_string(), "?".to_string()));
        return Err(ScheduleError::Cycle { from, to });
    }
    Ok(order)
}
