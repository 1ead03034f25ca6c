//! Claims: rewrite rules to be proved rather than assumed.
//!
//! A claim's body is a configuration term with embedded rewrite pairs; the
//! left projection plus the `requires` precondition gives the init state,
//! the right projection plus `ensures` the target. Claims arrive in a
//! versioned JSON file and carry a canonical attribute map: one ordered
//! string-to-string table, normalized on load, whatever shape the producing
//! toolchain used.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{json, Map, Value};

use crate::cterm::CTerm;
use crate::subst::rename_generated_vars;
use crate::term::{bool_to_ml_pred, extract_lhs, extract_rhs, RcTerm, Term, TermError};

/// Claim-set format tag.
pub const CLAIMS_FORMAT: &str = "MLCLAIMS";
/// Claim-set schema version.
pub const CLAIMS_VERSION: u64 = 1;

/// Attribute keys the driver interprets.
pub mod att {
    /// Human-readable claim label.
    pub const LABEL: &str = "label";
    /// Comma-separated labels of claims this one depends on.
    pub const DEPENDS: &str = "depends";
    /// The claim may use itself as a circularity.
    pub const CIRCULARITY: &str = "circularity";
    /// Admit the claim without proof.
    pub const TRUSTED: &str = "trusted";
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("cannot read claims: {0}")]
    Io(#[from] std::io::Error),
    #[error("claims file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad claims file: {0}")]
    BadFormat(String),
    #[error("bad claim term: {0}")]
    Term(#[from] TermError),
    #[error("duplicate claim label: {0}")]
    DuplicateLabel(String),
}

/// The canonical attribute map: sorted keys, string values.
///
/// Upstream toolchains serialize attributes in more than one shape (bare
/// flags, typed values, nested lists); normalization flattens them all to
/// strings here, with flags mapping to the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Atts(BTreeMap<String, String>);

impl Atts {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Normalize a JSON attribute object. Strings stay; booleans and numbers
    /// stringify; `null` marks a bare flag; arrays comma-join.
    pub fn from_value(value: &Value) -> Result<Atts, ClaimError> {
        let mut atts = Atts::default();
        let Some(obj) = value.as_object() else {
            return Err(ClaimError::BadFormat(format!("attributes must be an object: {value}")));
        };
        for (key, val) in obj {
            let rendered = match val {
                Value::Null => String::new(),
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Array(items) => {
                    let mut parts = Vec::with_capacity(items.len());
                    for item in items {
                        match item.as_str() {
                            Some(s) => parts.push(s.to_string()),
                            None => {
                                return Err(ClaimError::BadFormat(format!(
                                    "bad attribute list entry under `{key}`: {item}"
                                )))
                            }
                        }
                    }
                    parts.join(",")
                }
                Value::Object(_) => {
                    return Err(ClaimError::BadFormat(format!(
                        "nested attribute object under `{key}`"
                    )))
                }
            };
            atts.0.insert(key.clone(), rendered);
        }
        Ok(atts)
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        for (key, value) in &self.0 {
            obj.insert(key.clone(), Value::String(value.clone()));
        }
        Value::Object(obj)
    }
}

/// A reachability claim `lhs => rhs requires P ensures Q`.
#[derive(Debug, Clone)]
pub struct Claim {
    label: String,
    body: RcTerm,
    requires: RcTerm,
    ensures: RcTerm,
    atts: Atts,
}

impl Claim {
    pub fn new(
        label: impl Into<String>,
        body: RcTerm,
        requires: RcTerm,
        ensures: RcTerm,
        atts: Atts,
    ) -> Self {
        Claim { label: label.into(), body, requires, ensures, atts }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn atts(&self) -> &Atts {
        &self.atts
    }

    /// Labels of the claims this one cites as lemmas.
    pub fn depends(&self) -> Vec<String> {
        self.atts
            .get(att::DEPENDS)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_circularity(&self) -> bool {
        self.atts.contains(att::CIRCULARITY)
    }

    pub fn is_trusted(&self) -> bool {
        self.atts.contains(att::TRUSTED)
    }

    /// The init state: left rewrite projection under `requires`.
    pub fn lhs(&self) -> CTerm {
        CTerm::new(extract_lhs(&self.body), [bool_to_ml_pred(&self.requires)])
    }

    /// The target state: right rewrite projection under `ensures`.
    pub fn rhs(&self) -> CTerm {
        CTerm::new(extract_rhs(&self.body), [bool_to_ml_pred(&self.ensures)])
    }

    pub fn to_value(&self) -> Value {
        json!({
            "label": self.label,
            "body": self.body.to_value(),
            "requires": self.requires.to_value(),
            "ensures": self.ensures.to_value(),
            "atts": self.atts.to_value(),
        })
    }
}

/// An ordered set of claims from one input file.
#[derive(Debug, Clone, Default)]
pub struct ClaimSet {
    claims: Vec<Claim>,
}

impl ClaimSet {
    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    pub fn get(&self, label: &str) -> Option<&Claim> {
        self.claims.iter().find(|c| c.label() == label)
    }

    pub fn labels(&self) -> Vec<String> {
        self.claims.iter().map(|c| c.label().to_string()).collect()
    }

    /// Load a claim set, renaming generated variables apart across claims.
    pub fn load(path: &Path) -> Result<ClaimSet, ClaimError> {
        let raw = std::fs::read_to_string(path)?;
        ClaimSet::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<ClaimSet, ClaimError> {
        let value: Value = serde_json::from_str(raw)?;
        let obj = value
            .as_object()
            .ok_or_else(|| ClaimError::BadFormat("claims file is not an object".into()))?;

        match obj.get("format").and_then(Value::as_str) {
            Some(CLAIMS_FORMAT) => {}
            other => return Err(ClaimError::BadFormat(format!("format {other:?}"))),
        }
        match obj.get("version").and_then(Value::as_u64) {
            Some(CLAIMS_VERSION) => {}
            other => return Err(ClaimError::BadFormat(format!("version {other:?}"))),
        }

        let entries = obj
            .get("claims")
            .and_then(Value::as_array)
            .ok_or_else(|| ClaimError::BadFormat("missing claims array".into()))?;

        let mut counter: u64 = 0;
        let mut claims: Vec<Claim> = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let entry_obj = entry
                .as_object()
                .ok_or_else(|| ClaimError::BadFormat(format!("claim {index} is not an object")))?;

            let atts = match entry_obj.get("atts") {
                None => Atts::default(),
                Some(v) => Atts::from_value(v)?,
            };

            let label = entry_obj
                .get("label")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| atts.get(att::LABEL).map(str::to_string))
                .unwrap_or_else(|| format!("claim-{index}"));

            if claims.iter().any(|c: &Claim| c.label() == label) {
                return Err(ClaimError::DuplicateLabel(label));
            }

            let body = Term::from_value(
                entry_obj
                    .get("body")
                    .ok_or_else(|| ClaimError::BadFormat(format!("claim `{label}` has no body")))?,
            )?;
            let body = rename_generated_vars(&body, &mut counter);

            let requires = match entry_obj.get("requires") {
                None => crate::term::bool_token(true),
                Some(v) => {
                    let parsed = Term::from_value(v)?;
                    rename_generated_vars(&parsed, &mut counter)
                }
            };
            let ensures = match entry_obj.get("ensures") {
                None => crate::term::bool_token(true),
                Some(v) => {
                    let parsed = Term::from_value(v)?;
                    rename_generated_vars(&parsed, &mut counter)
                }
            };

            claims.push(Claim::new(label, body, requires, ensures, atts));
        }

        Ok(ClaimSet { claims })
    }
}
