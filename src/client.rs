//! The symbolic execution facade over the backend RPC.
//!
//! [`ExecutionBackend`] is the port the provers depend on; its operations
//! mirror the backend's five methods (`execute`, `simplify`, `implies`,
//! `get-model`, `add-module`) but speak constrained terms on both sides.
//! [`SymbolicClient`] is the JSON-RPC implementation; the recorded-
//! transcript replayer in [`crate::replay`] is the other one, used by tests.
//!
//! Wire translation conjoins a constrained term's configuration and
//! constraints into one matching-logic term, normalizes sort injections
//! against the subsort lattice on the way back in, and caches outbound
//! translations by content digest.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::cterm::{CSubst, CTerm};
use crate::definition::SubsortLattice;
use crate::rpc::{JsonRpcClient, RpcError};
use crate::subst::{Subst, SubstError};
use crate::term::{
    self, bottom_up, flatten_and, free_vars, from_wire, is_bottom, ml_and, ml_exists, to_wire,
    RcTerm, Term, TermError, INJ_LABEL,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Term(#[from] TermError),
    /// The backend could not proceed; fatal to the current proof step.
    #[error("backend aborted execution (unknown predicate: {unknown_predicate:?})")]
    Aborted { unknown_predicate: Option<String> },
    #[error("unexpected backend payload: {0}")]
    BadPayload(String),
    #[error("received a non-substitution witness: {0}")]
    BadWitness(#[from] SubstError),
}

/// One structured log entry from the backend (rule applications etc.).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry(pub Value);

impl LogEntry {
    /// The rule label, for rewrite log entries.
    pub fn rule(&self) -> Option<&str> {
        self.0.get("rule").and_then(Value::as_str)
    }
}

/// Why and where one `execute` call stopped.
#[derive(Debug, Clone)]
pub enum ExecuteResult {
    /// Reached the requested depth before halting.
    DepthBound { state: CTerm, depth: u64, rules: Vec<String> },
    /// No rule applies.
    Stuck { state: CTerm, depth: u64, rules: Vec<String> },
    /// Hit a designated terminal rule.
    Terminal { state: CTerm, depth: u64, rule: String, rules: Vec<String> },
    /// Hit a designated cut-point rule; the caller must branch.
    CutPoint { state: CTerm, depth: u64, rule: String, next_states: Vec<CTerm>, rules: Vec<String> },
    /// Rewriting diverged; the caller decides split vs. ndbranch.
    Branching { state: CTerm, depth: u64, next_states: Vec<CTerm>, rules: Vec<String> },
    /// The current path is infeasible.
    Vacuous { state: CTerm, depth: u64 },
}

impl ExecuteResult {
    pub fn depth(&self) -> u64 {
        match self {
            ExecuteResult::DepthBound { depth, .. }
            | ExecuteResult::Stuck { depth, .. }
            | ExecuteResult::Terminal { depth, .. }
            | ExecuteResult::CutPoint { depth, .. }
            | ExecuteResult::Branching { depth, .. }
            | ExecuteResult::Vacuous { depth, .. } => *depth,
        }
    }

    pub fn state(&self) -> &CTerm {
        match self {
            ExecuteResult::DepthBound { state, .. }
            | ExecuteResult::Stuck { state, .. }
            | ExecuteResult::Terminal { state, .. }
            | ExecuteResult::CutPoint { state, .. }
            | ExecuteResult::Branching { state, .. }
            | ExecuteResult::Vacuous { state, .. } => state,
        }
    }
}

/// `Sat` carries the model as a substitution of the free variables.
#[derive(Debug, Clone)]
pub enum GetModelResult {
    Sat(Subst),
    Unsat,
    Unknown,
}

/// Options forwarded with every `execute` call.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOpts {
    pub max_depth: Option<u64>,
    pub cut_point_rules: Vec<String>,
    pub terminal_rules: Vec<String>,
    pub module_name: Option<String>,
}

/// The backend port. The provers depend only on this; one implementation
/// speaks JSON-RPC to a live server, the other replays a recorded
/// transcript.
pub trait ExecutionBackend: Send {
    fn execute(
        &mut self,
        cterm: &CTerm,
        opts: &ExecuteOpts,
    ) -> impl std::future::Future<Output = Result<ExecuteResult, ClientError>> + Send;

    fn simplify(
        &mut self,
        cterm: &CTerm,
    ) -> impl std::future::Future<Output = Result<(CTerm, Vec<LogEntry>), ClientError>> + Send;

    /// `Ok(None)` when the implication does not hold; an undecided check
    /// surfaces as `Err(ClientError::Rpc(RpcError::ImplicationFailed))`.
    fn implies(
        &mut self,
        antecedent: &CTerm,
        consequent: &CTerm,
    ) -> impl std::future::Future<Output = Result<Option<CSubst>, ClientError>> + Send;

    fn get_model(
        &mut self,
        cterm: &CTerm,
        module_name: Option<&str>,
    ) -> impl std::future::Future<Output = Result<GetModelResult, ClientError>> + Send;

    /// Install an ephemeral module of extra axioms under `name`.
    fn add_module(
        &mut self,
        name: &str,
        axioms: Vec<Value>,
    ) -> impl std::future::Future<Output = Result<(), ClientError>> + Send;
}

/// The live JSON-RPC implementation of the backend port.
pub struct SymbolicClient {
    rpc: JsonRpcClient,
    lattice: Arc<SubsortLattice>,
    wire_cache: HashMap<String, Value>,
}

impl SymbolicClient {
    pub fn new(rpc: JsonRpcClient, lattice: Arc<SubsortLattice>) -> Self {
        SymbolicClient { rpc, lattice, wire_cache: HashMap::new() }
    }

    pub fn rpc(&self) -> &JsonRpcClient {
        &self.rpc
    }

    pub fn rpc_mut(&mut self) -> &mut JsonRpcClient {
        &mut self.rpc
    }

    /// Outbound translation, cached by the constrained term's digest.
    fn cterm_to_wire(&mut self, cterm: &CTerm) -> Value {
        if let Some(cached) = self.wire_cache.get(cterm.hash()) {
            return cached.clone();
        }
        let wire = to_wire(&cterm_term(cterm));
        self.wire_cache.insert(cterm.hash().to_string(), wire.clone());
        wire
    }

    fn cterm_from_wire(&self, value: &Value) -> Result<CTerm, ClientError> {
        let term = from_wire(value)?;
        let term = normalize_injections(&term, &self.lattice);
        split_cterm(&term)
    }
}

impl ExecutionBackend for SymbolicClient {
    async fn execute(
        &mut self,
        cterm: &CTerm,
        opts: &ExecuteOpts,
    ) -> Result<ExecuteResult, ClientError> {
        debug!(state = %cterm.hash(), "executing");
        let mut params = json!({
            "state": self.cterm_to_wire(cterm),
            "log-successful-rewrites": true,
        });
        if let Some(depth) = opts.max_depth {
            params["max-depth"] = json!(depth);
        }
        if !opts.cut_point_rules.is_empty() {
            params["cut-point-rules"] = json!(opts.cut_point_rules);
        }
        if !opts.terminal_rules.is_empty() {
            params["terminal-rules"] = json!(opts.terminal_rules);
        }
        if let Some(module) = &opts.module_name {
            params["module-name"] = json!(module);
        }
        let response = self.rpc.request("execute", params).await?;
        let lattice = self.lattice.clone();
        parse_execute_response(&response, &|v| {
            let term = from_wire(v)?;
            let term = normalize_injections(&term, &lattice);
            split_cterm(&term)
        })
    }

    async fn simplify(&mut self, cterm: &CTerm) -> Result<(CTerm, Vec<LogEntry>), ClientError> {
        debug!(state = %cterm.hash(), "simplifying");
        let params = json!({"state": self.cterm_to_wire(cterm)});
        let response = self.rpc.request("simplify", params).await?;
        let state = response
            .get("state")
            .ok_or_else(|| ClientError::BadPayload("simplify without state".into()))?;
        let simplified = self.cterm_from_wire(state)?;
        Ok((simplified, parse_logs(&response)))
    }

    async fn implies(
        &mut self,
        antecedent: &CTerm,
        consequent: &CTerm,
    ) -> Result<Option<CSubst>, ClientError> {
        debug!(
            antecedent = %antecedent.hash(),
            consequent = %consequent.hash(),
            "checking implication"
        );
        // Bind variables the antecedent does not know about existentially;
        // the backend treats the consequent's free variables as rigid.
        let known = antecedent.free_vars();
        let mut consequent_term = cterm_term(consequent);
        let mut unbound: Vec<String> =
            free_vars(&consequent_term).difference(&known).cloned().collect();
        unbound.sort();
        for name in unbound {
            consequent_term = ml_exists(Term::var(name), consequent_term);
        }

        let params = json!({
            "antecedent": self.cterm_to_wire(antecedent),
            "consequent": to_wire(&consequent_term),
        });
        let response = self.rpc.request("implies", params).await?;
        parse_implies_response(&response)
    }

    async fn get_model(
        &mut self,
        cterm: &CTerm,
        module_name: Option<&str>,
    ) -> Result<GetModelResult, ClientError> {
        let mut params = json!({"state": self.cterm_to_wire(cterm)});
        if let Some(module) = module_name {
            params["module"] = json!(module);
        }
        let response = self.rpc.request("get-model", params).await?;
        parse_get_model_response(&response)
    }

    async fn add_module(&mut self, name: &str, axioms: Vec<Value>) -> Result<(), ClientError> {
        let params = json!({"module": {"name": name, "axioms": axioms}});
        self.rpc.request("add-module", params).await?;
        Ok(())
    }
}

/// The one matching-logic term of a constrained term: configuration and
/// constraints conjoined.
pub fn cterm_term(cterm: &CTerm) -> RcTerm {
    ml_and(
        std::iter::once(cterm.config().clone()).chain(cterm.constraints().iter().cloned()),
    )
}

/// Split a conjunction back into configuration and constraints. Exactly one
/// conjunct must be a non-predicate (the configuration).
pub fn split_cterm(term: &RcTerm) -> Result<CTerm, ClientError> {
    let mut config: Option<RcTerm> = None;
    let mut constraints: Vec<RcTerm> = Vec::new();
    for conjunct in flatten_and(term) {
        if is_predicate(&conjunct) {
            constraints.push(conjunct);
        } else if config.is_none() {
            config = Some(conjunct);
        } else {
            return Err(ClientError::BadPayload(
                "more than one configuration in conjunction".into(),
            ));
        }
    }
    match config {
        Some(config) => Ok(CTerm::new(config, constraints)),
        None => Err(ClientError::BadPayload("no configuration in conjunction".into())),
    }
}

/// Matching-logic predicates are `#`-labeled applications.
fn is_predicate(term: &RcTerm) -> bool {
    matches!(term.as_ref(), Term::App { label, .. } if label.name.starts_with('#'))
}

/// Collapse nested and identity sort injections using the lattice:
/// `inj{B,C}(inj{A,B}(t))` becomes `inj{A,C}(t)`, `inj{A,A}(t)` becomes `t`.
pub fn normalize_injections(term: &RcTerm, lattice: &SubsortLattice) -> RcTerm {
    bottom_up(term, |t| {
        let Term::App { label, args } = t.as_ref() else { return t };
        if label.name != INJ_LABEL || label.sorts.len() != 2 || args.len() != 1 {
            return t;
        }
        let (from, to) = (&label.sorts[0], &label.sorts[1]);
        if from == to {
            return args[0].clone();
        }
        if let Term::App { label: inner_label, args: inner_args } = args[0].as_ref() {
            if inner_label.name == INJ_LABEL
                && inner_label.sorts.len() == 2
                && inner_args.len() == 1
            {
                let innermost = &inner_label.sorts[0];
                if lattice.admits(innermost, to) {
                    return term::inj(innermost.clone(), to.clone(), inner_args[0].clone());
                }
            }
        }
        t
    })
}

fn parse_logs(response: &Value) -> Vec<LogEntry> {
    response
        .get("logs")
        .and_then(Value::as_array)
        .map(|entries| entries.iter().cloned().map(LogEntry).collect())
        .unwrap_or_default()
}

/// Rule labels of the successful rewrites, in application order.
pub fn rules_from_logs(logs: &[LogEntry]) -> Vec<String> {
    logs.iter().filter_map(|l| l.rule().map(str::to_string)).collect()
}

/// Interpret one `execute` response.
pub fn parse_execute_response(
    response: &Value,
    parse_state: &dyn Fn(&Value) -> Result<CTerm, ClientError>,
) -> Result<ExecuteResult, ClientError> {
    let reason = response
        .get("reason")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::BadPayload("execute without reason".into()))?;

    if reason == "aborted" {
        let unknown_predicate = response
            .get("unknown-predicate")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Err(ClientError::Aborted { unknown_predicate });
    }

    let state = parse_state(
        response
            .get("state")
            .and_then(|s| s.get("term"))
            .ok_or_else(|| ClientError::BadPayload("execute without state".into()))?,
    )?;
    let depth = response
        .get("depth")
        .and_then(Value::as_u64)
        .ok_or_else(|| ClientError::BadPayload("execute without depth".into()))?;
    let logs = parse_logs(response);
    let rules = rules_from_logs(&logs);

    let mut next_states: Vec<CTerm> = Vec::new();
    if let Some(items) = response.get("next-states").and_then(Value::as_array) {
        for item in items {
            let term = item
                .get("term")
                .ok_or_else(|| ClientError::BadPayload("next state without term".into()))?;
            let next = parse_state(term)?;
            if next.is_bottom() {
                return Err(ClientError::BadPayload("bottom successor state".into()));
            }
            next_states.push(next);
        }
    }
    if next_states.len() == 1 && reason != "cut-point-rule" {
        return Err(ClientError::BadPayload(format!(
            "single successor state for reason `{reason}`"
        )));
    }

    let rule = || -> Result<String, ClientError> {
        response
            .get("rule")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::BadPayload(format!("reason `{reason}` without rule")))
    };

    match reason {
        "depth-bound" => Ok(ExecuteResult::DepthBound { state, depth, rules }),
        "stuck" => Ok(ExecuteResult::Stuck { state, depth, rules }),
        "terminal-rule" => Ok(ExecuteResult::Terminal { state, depth, rule: rule()?, rules }),
        "cut-point-rule" => {
            Ok(ExecuteResult::CutPoint { state, depth, rule: rule()?, next_states, rules })
        }
        "branching" => Ok(ExecuteResult::Branching { state, depth, next_states, rules }),
        "vacuous" => Ok(ExecuteResult::Vacuous { state, depth }),
        other => Err(ClientError::BadPayload(format!("unknown stop reason `{other}`"))),
    }
}

/// Interpret one `implies` response into an optional witness.
pub fn parse_implies_response(response: &Value) -> Result<Option<CSubst>, ClientError> {
    let satisfiable = response
        .get("satisfiable")
        .and_then(Value::as_bool)
        .ok_or_else(|| ClientError::BadPayload("implies without satisfiable".into()))?;
    if !satisfiable {
        return Ok(None);
    }

    let subst = match response.get("substitution") {
        None | Some(Value::Null) => Subst::new(),
        Some(value) => {
            let term = from_wire(value)?;
            Subst::from_pred(&term)?
        }
    };
    let constraints = match response.get("predicate") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => {
            let term = from_wire(value)?;
            if is_bottom(&term) {
                return Err(ClientError::BadPayload(
                    "satisfiable implication with bottom predicate".into(),
                ));
            }
            flatten_and(&term)
        }
    };
    Ok(Some(CSubst::new(subst, constraints)))
}

/// Interpret one `get-model` response.
pub fn parse_get_model_response(response: &Value) -> Result<GetModelResult, ClientError> {
    let verdict = response
        .get("satisfiable")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::BadPayload("get-model without satisfiable".into()))?;
    match verdict {
        "Unsat" => Ok(GetModelResult::Unsat),
        "Unknown" => Ok(GetModelResult::Unknown),
        "Sat" => {
            let subst = match response.get("substitution") {
                None | Some(Value::Null) => Subst::new(),
                Some(value) => {
                    let term = from_wire(value)?;
                    Subst::from_pred(&term)?
                }
            };
            Ok(GetModelResult::Sat(subst))
        }
        other => Err(ClientError::BadPayload(format!("unknown get-model verdict `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{int_token, ml_equals, ml_equals_true, Sort};

    fn state(config: RcTerm, constraints: Vec<RcTerm>) -> CTerm {
        CTerm::new(Term::apply("<top>", vec![config]), constraints)
    }

    fn wire_of(cterm: &CTerm) -> Value {
        to_wire(&cterm_term(cterm))
    }

    fn parse_state(v: &Value) -> Result<CTerm, ClientError> {
        split_cterm(&from_wire(v)?)
    }

    #[test]
    fn cterm_wire_roundtrip() {
        let original = state(
            Term::apply("run", vec![Term::var("N")]),
            vec![ml_equals_true(Term::apply("_<=Int_", vec![int_token(0), Term::var("N")]))],
        );
        let back = split_cterm(&from_wire(&wire_of(&original)).unwrap()).unwrap();
        assert_eq!(original, back);
    }

    #[test]
    fn split_cterm_requires_one_configuration() {
        let two_configs = ml_and(vec![
            Term::apply("<top>", vec![int_token(1)]),
            Term::apply("<top>", vec![int_token(2)]),
        ]);
        assert!(matches!(
            split_cterm(&two_configs),
            Err(ClientError::BadPayload(_))
        ));
        let only_preds = ml_equals_true(Term::var("B"));
        assert!(matches!(split_cterm(&only_preds), Err(ClientError::BadPayload(_))));
    }

    #[test]
    fn injection_normalization() {
        let lattice = SubsortLattice::from_pairs(vec![
            ("Int".to_string(), "AExp".to_string()),
            ("AExp".to_string(), "KItem".to_string()),
            ("Int".to_string(), "KItem".to_string()),
        ]);
        let nested = term::inj(
            Sort::new("AExp"),
            Sort::new("KItem"),
            term::inj(Sort::new("Int"), Sort::new("AExp"), int_token(3)),
        );
        let normalized = normalize_injections(&nested, &lattice);
        assert_eq!(
            *normalized,
            *term::inj(Sort::new("Int"), Sort::new("KItem"), int_token(3))
        );

        let identity = term::inj(Sort::new("Int"), Sort::new("Int"), int_token(3));
        assert_eq!(*normalize_injections(&identity, &lattice), *int_token(3));
    }

    #[test]
    fn execute_depth_bound_parses() {
        let next = state(Term::apply("done", vec![]), vec![]);
        let response = json!({
            "reason": "depth-bound",
            "state": {"term": wire_of(&next)},
            "depth": 10,
            "logs": [{"kind": "rewrite", "rule": "step"}, {"kind": "rewrite", "rule": "step"}],
        });
        match parse_execute_response(&response, &parse_state).unwrap() {
            ExecuteResult::DepthBound { state, depth, rules } => {
                assert_eq!(depth, 10);
                assert_eq!(rules, vec!["step", "step"]);
                assert_eq!(state, next);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn execute_cut_point_keeps_next_states() {
        let s = state(Term::apply("loop-head", vec![]), vec![]);
        let n1 = state(Term::apply("body", vec![]), vec![]);
        let n2 = state(Term::apply("exit", vec![]), vec![]);
        let response = json!({
            "reason": "cut-point-rule",
            "rule": "while-unroll",
            "state": {"term": wire_of(&s)},
            "depth": 3,
            "next-states": [{"term": wire_of(&n1)}, {"term": wire_of(&n2)}],
        });
        match parse_execute_response(&response, &parse_state).unwrap() {
            ExecuteResult::CutPoint { rule, next_states, .. } => {
                assert_eq!(rule, "while-unroll");
                assert_eq!(next_states, vec![n1, n2]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn execute_rejects_single_successor_branching() {
        let s = state(Term::apply("x", vec![]), vec![]);
        let response = json!({
            "reason": "branching",
            "state": {"term": wire_of(&s)},
            "depth": 1,
            "next-states": [{"term": wire_of(&s)}],
        });
        assert!(matches!(
            parse_execute_response(&response, &parse_state),
            Err(ClientError::BadPayload(_))
        ));
    }

    #[test]
    fn execute_aborted_is_fatal() {
        let response = json!({"reason": "aborted", "unknown-predicate": "f(X)"});
        match parse_execute_response(&response, &parse_state).unwrap_err() {
            ClientError::Aborted { unknown_predicate } => {
                assert_eq!(unknown_predicate.as_deref(), Some("f(X)"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn implies_decomposes_witness() {
        let subst_pred = ml_equals(Term::var("N"), int_token(7));
        let residual = ml_equals_true(Term::var("B"));
        let response = json!({
            "satisfiable": true,
            "implication": to_wire(&crate::term::ml_top()),
            "substitution": to_wire(&subst_pred),
            "predicate": to_wire(&residual),
        });
        let csubst = parse_implies_response(&response).unwrap().unwrap();
        assert_eq!(csubst.subst.get("N"), Some(&int_token(7)));
        assert_eq!(csubst.constraints, vec![residual]);
    }

    #[test]
    fn implies_unsatisfiable_is_none() {
        let response = json!({
            "satisfiable": false,
            "implication": to_wire(&crate::term::ml_top()),
        });
        assert!(parse_implies_response(&response).unwrap().is_none());
    }

    #[test]
    fn implies_rejects_garbage_witness() {
        let response = json!({
            "satisfiable": true,
            "implication": to_wire(&crate::term::ml_top()),
            "substitution": to_wire(&ml_equals_true(Term::var("B"))),
        });
        assert!(matches!(
            parse_implies_response(&response),
            Err(ClientError::BadWitness(_))
        ));
    }

    #[test]
    fn get_model_verdicts() {
        let sat = json!({
            "satisfiable": "Sat",
            "substitution": to_wire(&ml_equals(Term::var("X"), int_token(1))),
        });
        match parse_get_model_response(&sat).unwrap() {
            GetModelResult::Sat(subst) => assert_eq!(subst.get("X"), Some(&int_token(1))),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            parse_get_model_response(&json!({"satisfiable": "Unsat"})).unwrap(),
            GetModelResult::Unsat
        ));
        assert!(matches!(
            parse_get_model_response(&json!({"satisfiable": "Unknown"})).unwrap(),
            GetModelResult::Unknown
        ));
    }
}
