//! Proof state: a graph plus the verdict bookkeeping around it.
//!
//! A [`ReachProof`] owns the exploration graph of one claim together with
//! the node sets the graph itself does not track: implications the backend
//! could not decide (`undecided`) and loops cut off by the bounded
//! model-checking depth (`bounded`). The status algebra is deterministic:
//! an admitted proof passes; a failing leaf fails the proof; anything still
//! pending or undecided keeps it pending; otherwise it passes.
//!
//! Proofs persist as one JSON file per proof keyed by `sha256(id)`, with an
//! optional one-file-per-node form for incremental updates.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::cfg::{Cfg, CfgError, Node, NodeId};
use crate::claim::Claim;
use crate::store::{CfgStore, StoreError};
use crate::utils::{atomic_write, hash_str};

/// Proof file format tag.
pub const PROOF_FORMAT: &str = "MLPROOF";
/// Proof file schema version.
pub const PROOF_VERSION: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    #[error("cannot access proof storage: {0}")]
    Io(#[from] std::io::Error),
    #[error("proof file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad proof file: {0}")]
    BadFormat(String),
    #[error("no proof named `{0}` in the save directory")]
    NotFound(String),
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The deterministic verdict of a proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStatus {
    Passed,
    Failed,
    Pending,
}

impl fmt::Display for ProofStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProofStatus::Passed => write!(f, "passed"),
            ProofStatus::Failed => write!(f, "failed"),
            ProofStatus::Pending => write!(f, "pending"),
        }
    }
}

/// An all-path reachability proof in progress.
#[derive(Debug, Clone)]
pub struct ReachProof {
    pub id: String,
    pub cfg: Cfg,
    pub init: NodeId,
    pub target: NodeId,
    /// Labels of the claims this proof uses as lemmas.
    pub subproof_ids: Vec<String>,
    /// Trusted without proof.
    pub admitted: bool,
    /// The claim may be used as its own circularity once progress is made.
    pub circularity: bool,
    /// Loop-unrolling bound; `None` disables bounding.
    pub bmc_depth: Option<u64>,
    undecided: BTreeSet<NodeId>,
    bounded: BTreeSet<NodeId>,
    /// Per-node failure notes (aborts, transport exhaustion, undecided
    /// implications), for the summary and the bug report.
    pub failure_log: Vec<(NodeId, String)>,
}

impl ReachProof {
    /// Start a proof from a claim: a two-node graph plus the claim's
    /// attributes.
    pub fn from_claim(claim: &Claim) -> Result<ReachProof, CfgError> {
        let (cfg, init, target) = Cfg::from_claim(claim)?;
        Ok(ReachProof {
            id: claim.label().to_string(),
            cfg,
            init,
            target,
            subproof_ids: claim.depends(),
            admitted: claim.is_trusted(),
            circularity: claim.is_circularity(),
            bmc_depth: None,
            undecided: BTreeSet::new(),
            bounded: BTreeSet::new(),
            failure_log: Vec::new(),
        })
    }

    pub fn with_bmc_depth(mut self, depth: Option<u64>) -> Self {
        self.bmc_depth = depth;
        self
    }

    /// Record an implication the backend could not decide. The node leaves
    /// the frontier but counts as neither proved nor failing.
    pub fn add_undecided(&mut self, id: &NodeId) {
        self.undecided.insert(id.clone());
    }

    pub fn is_undecided(&self, id: &NodeId) -> bool {
        self.undecided.contains(id)
    }

    /// Mark a node cut off by the bounded model-checking depth.
    pub fn add_bounded(&mut self, id: &NodeId) {
        self.bounded.insert(id.clone());
    }

    pub fn is_bounded(&self, id: &NodeId) -> bool {
        self.bounded.contains(id)
    }

    pub fn is_pending(&self, id: &NodeId) -> bool {
        self.cfg.is_pending(id) && !self.is_undecided(id) && !self.is_bounded(id)
    }

    /// Frontier nodes still needing work, in creation order.
    pub fn pending(&self) -> Vec<&Node> {
        self.cfg
            .frontier()
            .into_iter()
            .filter(|n| !self.is_undecided(&n.id) && !self.is_bounded(&n.id))
            .collect()
    }

    /// A leaf fails when nothing can close it: not covered, not the
    /// target, not vacuous, and no longer pending or undecided.
    pub fn is_failing(&self, id: &NodeId) -> bool {
        self.cfg.is_leaf(id)
            && !self.cfg.is_covered(id)
            && !self.cfg.is_target(id)
            && !self.cfg.is_vacuous(id)
            && !self.cfg.is_admitted(id)
            && !self.is_pending(id)
            && !self.is_undecided(id)
    }

    pub fn failing(&self) -> Vec<&Node> {
        self.cfg.nodes().filter(|n| self.is_failing(&n.id)).collect()
    }

    /// Status of this proof alone; dependency aggregation is the
    /// scheduler's concern.
    pub fn status(&self) -> ProofStatus {
        if self.admitted {
            return ProofStatus::Passed;
        }
        if !self.failing().is_empty() {
            return ProofStatus::Failed;
        }
        if !self.pending().is_empty() || !self.undecided.is_empty() {
            return ProofStatus::Pending;
        }
        ProofStatus::Passed
    }

    /// Human-readable progress lines.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![
            format!("reachability proof: {}", self.id),
            format!("    status: {}", self.status()),
            format!("    admitted: {}", self.admitted),
            format!("    nodes: {}", self.cfg.node_count()),
            format!("    pending: {}", self.pending().len()),
            format!("    failing: {}", self.failing().len()),
            format!("    undecided: {}", self.undecided.len()),
            format!("    bounded: {}", self.bounded.len()),
            format!("    subproofs: {}", self.subproof_ids.len()),
        ];
        for (node, reason) in &self.failure_log {
            lines.push(format!("    failure at {}: {}", node.shortened(), reason));
        }
        lines
    }

    // -- persistence ---------------------------------------------------------

    pub fn to_dict(&self) -> Value {
        let mut dict = Map::new();
        dict.insert("format".into(), json!(PROOF_FORMAT));
        dict.insert("version".into(), json!(PROOF_VERSION));
        dict.insert("type".into(), json!("ReachProof"));
        dict.insert("id".into(), json!(self.id));
        dict.insert("cfg".into(), self.cfg.to_dict());
        dict.insert("init".into(), json!(self.init.as_str()));
        dict.insert("target".into(), json!(self.target.as_str()));
        dict.insert("subproof_ids".into(), json!(self.subproof_ids));
        dict.insert("admitted".into(), json!(self.admitted));
        dict.insert("circularity".into(), json!(self.circularity));
        if let Some(depth) = self.bmc_depth {
            dict.insert("bmc_depth".into(), json!(depth));
        }
        dict.insert(
            "undecided".into(),
            json!(self.undecided.iter().map(NodeId::as_str).collect::<Vec<_>>()),
        );
        dict.insert(
            "bounded".into(),
            json!(self.bounded.iter().map(NodeId::as_str).collect::<Vec<_>>()),
        );
        dict.insert(
            "failure_log".into(),
            json!(self
                .failure_log
                .iter()
                .map(|(id, reason)| json!({"node": id.as_str(), "reason": reason}))
                .collect::<Vec<_>>()),
        );
        Value::Object(dict)
    }

    pub fn from_dict(value: &Value) -> Result<ReachProof, ProofError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ProofError::BadFormat("proof is not an object".into()))?;
        match obj.get("format").and_then(Value::as_str) {
            Some(PROOF_FORMAT) => {}
            other => return Err(ProofError::BadFormat(format!("format {other:?}"))),
        }
        match obj.get("version").and_then(Value::as_u64) {
            Some(PROOF_VERSION) => {}
            other => return Err(ProofError::BadFormat(format!("version {other:?}"))),
        }
        match obj.get("type").and_then(Value::as_str) {
            Some("ReachProof") => {}
            other => return Err(ProofError::BadFormat(format!("proof type {other:?}"))),
        }

        let cfg = Cfg::from_dict(
            obj.get("cfg")
                .ok_or_else(|| ProofError::BadFormat("proof without cfg".into()))?,
        )?;
        let node_ref = |key: &str| -> Result<NodeId, ProofError> {
            let raw = obj
                .get(key)
                .and_then(Value::as_str)
                .ok_or_else(|| ProofError::BadFormat(format!("proof without {key}")))?;
            Ok(cfg.resolve(raw)?)
        };
        let init = node_ref("init")?;
        let target = node_ref("target")?;

        let id_set = |key: &str| -> Result<BTreeSet<NodeId>, ProofError> {
            let mut set = BTreeSet::new();
            if let Some(items) = obj.get(key).and_then(Value::as_array) {
                for item in items {
                    let raw = item
                        .as_str()
                        .ok_or_else(|| ProofError::BadFormat(format!("bad id under {key}")))?;
                    set.insert(cfg.resolve(raw)?);
                }
            }
            Ok(set)
        };
        let undecided = id_set("undecided")?;
        let bounded = id_set("bounded")?;

        let mut failure_log: Vec<(NodeId, String)> = Vec::new();
        if let Some(items) = obj.get("failure_log").and_then(Value::as_array) {
            for item in items {
                let node = item
                    .get("node")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProofError::BadFormat("failure entry without node".into()))?;
                let reason = item
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                failure_log.push((cfg.resolve(node)?, reason));
            }
        }

        Ok(ReachProof {
            id: obj
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| ProofError::BadFormat("proof without id".into()))?
                .to_string(),
            cfg,
            init,
            target,
            subproof_ids: obj
                .get("subproof_ids")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            admitted: obj.get("admitted").and_then(Value::as_bool).unwrap_or(false),
            circularity: obj.get("circularity").and_then(Value::as_bool).unwrap_or(false),
            bmc_depth: obj.get("bmc_depth").and_then(Value::as_u64),
            undecided,
            bounded,
            failure_log,
        })
    }

    /// Path of this proof's file under `dir`.
    pub fn proof_path(id: &str, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", hash_str(id)))
    }

    pub fn proof_exists(id: &str, dir: &Path) -> bool {
        ReachProof::proof_path(id, dir).is_file()
    }

    /// Write the single-file form atomically.
    pub fn write_proof(&self, dir: &Path) -> Result<(), ProofError> {
        std::fs::create_dir_all(dir)?;
        let path = ReachProof::proof_path(&self.id, dir);
        atomic_write(&path, self.to_dict().to_string().as_bytes())?;
        Ok(())
    }

    pub fn read_proof(id: &str, dir: &Path) -> Result<ReachProof, ProofError> {
        let path = ReachProof::proof_path(id, dir);
        if !path.is_file() {
            return Err(ProofError::NotFound(id.to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        ReachProof::from_dict(&serde_json::from_str(&raw)?)
    }

    /// Write the one-file-per-node form under `dir/<sha256(id)>/`:
    /// the graph goes through [`CfgStore`] and the rest of the proof into
    /// its own manifest.
    pub fn write_proof_data(&self, dir: &Path) -> Result<(), ProofError> {
        let root = dir.join(hash_str(&self.id));
        let mut store = CfgStore::new(&root)?;
        store.write_cfg_data(&self.cfg)?;
        let mut manifest = self.to_dict();
        if let Some(obj) = manifest.as_object_mut() {
            obj.remove("cfg");
        }
        atomic_write(&root.join("proof.json"), manifest.to_string().as_bytes())?;
        Ok(())
    }

    /// Read the one-file-per-node form back.
    pub fn read_proof_data(id: &str, dir: &Path) -> Result<ReachProof, ProofError> {
        let root = dir.join(hash_str(id));
        if !root.join("proof.json").is_file() {
            return Err(ProofError::NotFound(id.to_string()));
        }
        let mut store = CfgStore::new(&root)?;
        let cfg = store.read_cfg_data()?;
        let raw = std::fs::read_to_string(root.join("proof.json"))?;
        let mut manifest: Value = serde_json::from_str(&raw)?;
        if let Some(obj) = manifest.as_object_mut() {
            obj.insert("cfg".into(), cfg.to_dict());
        }
        ReachProof::from_dict(&manifest)
    }

    /// Proof ids present in a save directory (single-file form).
    pub fn list_proofs(dir: &Path) -> Result<Vec<String>, ProofError> {
        let mut ids = Vec::new();
        if !dir.is_dir() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "json") {
                if let Ok(raw) = std::fs::read_to_string(&path) {
                    if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                        if value.get("format").and_then(Value::as_str) == Some(PROOF_FORMAT) {
                            if let Some(id) = value.get("id").and_then(Value::as_str) {
                                ids.push(id.to_string());
                            }
                        }
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
