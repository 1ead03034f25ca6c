//! Node storage: term interning and the one-file-per-node disk form.
//!
//! [`TermPool`] deduplicates structurally identical subterms behind shared
//! handles, keyed by pool ids rather than digests so interning a term is one
//! bottom-up pass. [`CfgStore`] persists a graph as `nodes/<id>.json` plus a
//! `manifest.json` for everything else; nodes are content-addressed, so an
//! incremental write only creates missing node files and removes stale ones,
//! and every file lands via write-then-rename.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::cfg::{Cfg, CfgError, NodeId};
use crate::cterm::CTerm;
use crate::term::{bottom_up_with_summary, Label, RcTerm, Sort, Term, TermError};
use crate::utils::atomic_write;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("graph store i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("graph store holds invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Term(#[from] TermError),
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error("bad store layout: {0}")]
    BadLayout(String),
}

/// Structural key of an interned node: own data plus child pool ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PoolKey {
    Var(String, Option<Sort>),
    Token(String, Sort),
    App(Label, Vec<usize>),
    Seq(Vec<usize>),
    Rewrite(usize, usize),
    As(usize, String),
}

/// An interning pool: identical subterms come back as the same handle.
#[derive(Debug, Default)]
pub struct TermPool {
    ids: HashMap<PoolKey, usize>,
    terms: Vec<RcTerm>,
}

impl TermPool {
    pub fn new() -> Self {
        TermPool::default()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Rebuild `term` with every subterm shared through the pool.
    pub fn intern(&mut self, term: &Term) -> RcTerm {
        let (interned, _) = bottom_up_with_summary(term, |node, child_ids: &[usize]| {
            let key = match node {
                Term::Var { name, sort } => PoolKey::Var(name.clone(), sort.clone()),
                Term::Token { token, sort } => PoolKey::Token(token.clone(), sort.clone()),
                Term::App { label, .. } => PoolKey::App(label.clone(), child_ids.to_vec()),
                Term::Seq { .. } => PoolKey::Seq(child_ids.to_vec()),
                Term::Rewrite { .. } => PoolKey::Rewrite(child_ids[0], child_ids[1]),
                Term::As { name, .. } => PoolKey::As(child_ids[0], name.clone()),
            };
            if let Some(&id) = self.ids.get(&key) {
                return (self.terms[id].clone(), id);
            }
            let children: Vec<RcTerm> =
                child_ids.iter().map(|&i| self.terms[i].clone()).collect();
            let rebuilt = node.with_children(children);
            let id = self.terms.len();
            self.terms.push(rebuilt.clone());
            self.ids.insert(key, id);
            (rebuilt, id)
        });
        interned
    }

    /// Intern a constrained term (configuration and constraints).
    pub fn intern_cterm(&mut self, cterm: &CTerm) -> CTerm {
        let config = self.intern(cterm.config());
        let constraints: Vec<RcTerm> =
            cterm.constraints().iter().map(|c| self.intern(c)).collect();
        CTerm::new(config, constraints)
    }
}

/// On-disk form of a graph: a manifest plus one file per node.
pub struct CfgStore {
    dir: PathBuf,
    pool: TermPool,
}

/// Manifest file name inside a store directory.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Node subdirectory inside a store directory.
pub const NODES_DIR: &str = "nodes";

impl CfgStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn new(dir: &Path) -> Result<CfgStore, StoreError> {
        fs::create_dir_all(dir.join(NODES_DIR))?;
        Ok(CfgStore { dir: dir.to_path_buf(), pool: TermPool::new() })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn node_path(&self, id: &NodeId) -> PathBuf {
        self.dir.join(NODES_DIR).join(format!("{id}.json"))
    }

    /// Persist the graph incrementally: missing node files are written,
    /// stale ones removed, and the manifest replaced atomically.
    ///
    /// Node files are keyed by content digest, so an existing file is
    /// already up to date and is left alone.
    pub fn write_cfg_data(&mut self, cfg: &Cfg) -> Result<(), StoreError> {
        let mut live: BTreeSet<String> = BTreeSet::new();
        for node in cfg.nodes() {
            live.insert(format!("{}.json", node.id));
            let path = self.node_path(&node.id);
            if !path.exists() {
                let payload = json!({
                    "id": node.id.as_str(),
                    "index": node.index,
                    "cterm": node.cterm.to_value(),
                });
                atomic_write(&path, payload.to_string().as_bytes())?;
            }
        }

        for entry in fs::read_dir(self.dir.join(NODES_DIR))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") && !live.contains(&name) {
                fs::remove_file(entry.path())?;
            }
        }

        let mut manifest = cfg.to_dict();
        if let Some(obj) = manifest.as_object_mut() {
            obj.remove("nodes");
            let ids: Vec<Value> = cfg
                .nodes()
                .map(|n| Value::String(n.id.as_str().to_string()))
                .collect();
            obj.insert("node_ids".into(), Value::Array(ids));
        }
        atomic_write(&self.dir.join(MANIFEST_FILE), manifest.to_string().as_bytes())?;
        Ok(())
    }

    /// Load the graph back, interning node terms through the pool so
    /// structurally shared subterms share memory across nodes.
    pub fn read_cfg_data(&mut self) -> Result<Cfg, StoreError> {
        let manifest_raw = fs::read_to_string(self.dir.join(MANIFEST_FILE))?;
        let mut manifest: Value = serde_json::from_str(&manifest_raw)?;
        let obj = manifest
            .as_object_mut()
            .ok_or_else(|| StoreError::BadLayout("manifest is not an object".into()))?;

        let ids: Vec<String> = match obj.remove("node_ids") {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s),
                    other => Err(StoreError::BadLayout(format!("bad node id: {other}"))),
                })
                .collect::<Result<_, _>>()?,
            _ => return Err(StoreError::BadLayout("manifest without node_ids".into())),
        };

        let mut nodes: Vec<Value> = Vec::with_capacity(ids.len());
        for id in &ids {
            let path = self.dir.join(NODES_DIR).join(format!("{id}.json"));
            let raw = fs::read_to_string(&path).map_err(|e| {
                StoreError::BadLayout(format!("missing node file {}: {e}", path.display()))
            })?;
            let node: Value = serde_json::from_str(&raw)?;
            let cterm = CTerm::from_value(
                node.get("cterm")
                    .ok_or_else(|| StoreError::BadLayout(format!("node {id} without cterm")))?,
            )?;
            let interned = self.pool.intern_cterm(&cterm);
            nodes.push(json!({
                "id": node.get("id").cloned().unwrap_or_else(|| Value::String(id.clone())),
                "index": node.get("index").cloned().unwrap_or(Value::Null),
                "cterm": interned.to_value(),
            }));
        }
        obj.insert("nodes".into(), Value::Array(nodes));

        Ok(Cfg::from_dict(&manifest)?)
    }
}
