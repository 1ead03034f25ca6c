//! Compiled-definition sidecar: module names and the subsort lattice.
//!
//! The compiled semantics lives in a directory the driver reads but never
//! writes. Next to the backend's own definition file sits a JSON sidecar
//! (`definition.json`) carrying what the driver needs: the main module name,
//! the module list, and the subsort pairs. The lattice is closed
//! reflexively and transitively on load and then shared read-only.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::term::Sort;

/// Sidecar format tag.
pub const DEF_FORMAT: &str = "MLDEF";
/// Sidecar schema version.
pub const DEF_VERSION: u64 = 1;

/// File name of the sidecar inside a compiled definition directory.
pub const SIDECAR_FILE: &str = "definition.json";

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("cannot read compiled definition: {0}")]
    Io(#[from] std::io::Error),
    #[error("compiled definition sidecar is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad definition sidecar: {0}")]
    BadFormat(String),
    #[error("unknown module: {0}")]
    UnknownModule(String),
}

/// The reflexive-transitive subsort relation of the compiled definition.
#[derive(Debug, Clone, Default)]
pub struct SubsortLattice {
    supers: BTreeMap<String, BTreeSet<String>>,
}

impl SubsortLattice {
    /// Close a set of direct `(sub, super)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut supers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (sub, sup) in pairs {
            supers.entry(sub).or_default().insert(sup);
        }
        // transitive closure by iteration to a fixed point; subsort chains
        // are short in practice
        loop {
            let mut grew = false;
            let snapshot = supers.clone();
            for ups in supers.values_mut() {
                let mut extra: BTreeSet<String> = BTreeSet::new();
                for up in ups.iter() {
                    if let Some(more) = snapshot.get(up) {
                        extra.extend(more.iter().cloned());
                    }
                }
                for sort in extra {
                    grew |= ups.insert(sort);
                }
            }
            if !grew {
                break;
            }
        }
        SubsortLattice { supers }
    }

    /// Is `sub` a (reflexive) subsort of `sup`?
    pub fn admits(&self, sub: &Sort, sup: &Sort) -> bool {
        sub == sup
            || self
                .supers
                .get(&sub.0)
                .map_or(false, |ups| ups.contains(&sup.0))
    }
}

/// A compiled definition directory, read-only.
#[derive(Debug, Clone)]
pub struct Definition {
    path: PathBuf,
    main_module: String,
    modules: BTreeSet<String>,
    subsorts: SubsortLattice,
}

impl Definition {
    /// Load the sidecar from a compiled definition directory.
    pub fn load(dir: &Path) -> Result<Definition, DefinitionError> {
        let sidecar = dir.join(SIDECAR_FILE);
        let raw = std::fs::read_to_string(&sidecar)?;
        let value: Value = serde_json::from_str(&raw)?;
        let obj = value
            .as_object()
            .ok_or_else(|| DefinitionError::BadFormat("sidecar is not an object".into()))?;

        match obj.get("format").and_then(Value::as_str) {
            Some(DEF_FORMAT) => {}
            other => return Err(DefinitionError::BadFormat(format!("format {other:?}"))),
        }
        match obj.get("version").and_then(Value::as_u64) {
            Some(DEF_VERSION) => {}
            other => return Err(DefinitionError::BadFormat(format!("version {other:?}"))),
        }

        let main_module = obj
            .get("main_module")
            .and_then(Value::as_str)
            .ok_or_else(|| DefinitionError::BadFormat("missing main_module".into()))?
            .to_string();

        let mut modules: BTreeSet<String> = BTreeSet::new();
        if let Some(Value::Array(items)) = obj.get("modules") {
            for item in items {
                match item.as_str() {
                    Some(name) => {
                        modules.insert(name.to_string());
                    }
                    None => {
                        return Err(DefinitionError::BadFormat(format!("bad module entry: {item}")))
                    }
                }
            }
        }
        modules.insert(main_module.clone());

        let mut pairs: Vec<(String, String)> = Vec::new();
        if let Some(Value::Array(items)) = obj.get("subsorts") {
            for item in items {
                match item.as_array().map(Vec::as_slice) {
                    Some([sub, sup]) => match (sub.as_str(), sup.as_str()) {
                        (Some(sub), Some(sup)) => pairs.push((sub.to_string(), sup.to_string())),
                        _ => {
                            return Err(DefinitionError::BadFormat(format!(
                                "bad subsort pair: {item}"
                            )))
                        }
                    },
                    _ => {
                        return Err(DefinitionError::BadFormat(format!("bad subsort pair: {item}")))
                    }
                }
            }
        }

        Ok(Definition {
            path: dir.to_path_buf(),
            main_module,
            modules,
            subsorts: SubsortLattice::from_pairs(pairs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn main_module(&self) -> &str {
        &self.main_module
    }

    pub fn subsorts(&self) -> &SubsortLattice {
        &self.subsorts
    }

    /// Resolve a module name, defaulting to the main module.
    pub fn module(&self, name: Option<&str>) -> Result<&str, DefinitionError> {
        match name {
            None => Ok(&self.main_module),
            Some(name) => self
                .modules
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| DefinitionError::UnknownModule(name.to_string())),
        }
    }
}
