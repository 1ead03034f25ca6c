//! A recorded-transcript implementation of the backend port.
//!
//! The provers depend on [`ExecutionBackend`] only, so a proof can run
//! against recordings instead of a live server: end-to-end tests script the
//! backend's answers, and `--replay` debugging reruns a bug-report
//! transcript. Responses are keyed by the content digests of the terms in
//! the request, which is exactly how the live client's caches are keyed.
//!
//! In strict mode a request with no recorded answer is an error; lenient
//! mode degrades the way a weak backend would (`simplify` is identity,
//! `get-model` answers Unknown, `implies` answers "no").

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use crate::client::{
    parse_execute_response, parse_implies_response, split_cterm, ClientError, ExecuteOpts,
    ExecuteResult, ExecutionBackend, GetModelResult, LogEntry,
};
use crate::cterm::{CSubst, CTerm};
use crate::rpc::{RpcError, Transcript, CODE_IMPLICATION_FAILED};
use crate::term::{from_wire, RcTerm, Term, ML_EXISTS};

type ImpliesKey = (String, String);

/// Replays recorded backend behavior.
#[derive(Default)]
pub struct ReplayBackend {
    executes: HashMap<String, VecDeque<ExecuteResult>>,
    implications: HashMap<ImpliesKey, Option<CSubst>>,
    undecided: HashMap<ImpliesKey, String>,
    simplifications: HashMap<String, CTerm>,
    models: HashMap<String, GetModelResult>,
    strict: bool,
    /// Methods called, in order; tests assert over this.
    pub calls: Vec<String>,
    /// Modules installed via `add-module`, in order.
    pub modules: Vec<(String, Vec<Value>)>,
}

impl ReplayBackend {
    /// A lenient replayer with no recordings.
    pub fn new() -> Self {
        ReplayBackend::default()
    }

    /// Missing recordings become errors instead of neutral answers.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Queue the next `execute` answer for a state.
    pub fn on_execute(&mut self, state: &CTerm, result: ExecuteResult) {
        self.executes.entry(state.hash().to_string()).or_default().push_back(result);
    }

    /// Record an `implies` verdict for an (antecedent, consequent) pair.
    pub fn on_implies(&mut self, antecedent: &CTerm, consequent: &CTerm, witness: Option<CSubst>) {
        self.implications.insert(implies_key(antecedent, consequent), witness);
    }

    /// Record an `implies` check the backend cannot decide.
    pub fn on_implies_undecided(&mut self, antecedent: &CTerm, consequent: &CTerm, reason: &str) {
        self.undecided.insert(implies_key(antecedent, consequent), reason.to_string());
    }

    pub fn on_simplify(&mut self, state: &CTerm, simplified: CTerm) {
        self.simplifications.insert(state.hash().to_string(), simplified);
    }

    pub fn on_get_model(&mut self, state: &CTerm, result: GetModelResult) {
        self.models.insert(state.hash().to_string(), result);
    }

    /// Rebuild a replayer from a live client's transcript. The recorded
    /// terms are already in canonical wire form, so no lattice is needed.
    pub fn from_transcript(transcript: &Transcript) -> Result<ReplayBackend, ClientError> {
        let mut replay = ReplayBackend::new().strict();
        for entry in &transcript.entries {
            let params = entry.request.get("params").cloned().unwrap_or(Value::Null);
            let result = entry.response.get("result");
            match entry.method.as_str() {
                "execute" => {
                    let state = wire_state(&params, "state")?;
                    let Some(result) = result else { continue };
                    let parsed =
                        parse_execute_response(result, &|v| split_cterm(&from_wire(v)?))?;
                    replay
                        .executes
                        .entry(state.hash().to_string())
                        .or_default()
                        .push_back(parsed);
                }
                "implies" => {
                    let antecedent = wire_state(&params, "antecedent")?;
                    let consequent = wire_state(&params, "consequent")?;
                    let key = implies_key(&antecedent, &consequent);
                    if let Some(error) = entry.response.get("error") {
                        if error.get("code").and_then(Value::as_i64)
                            == Some(CODE_IMPLICATION_FAILED)
                        {
                            let reason = error
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("implication check failed")
                                .to_string();
                            replay.undecided.insert(key, reason);
                        }
                        continue;
                    }
                    let Some(result) = result else { continue };
                    replay.implications.insert(key, parse_implies_response(result)?);
                }
                "simplify" => {
                    let state = wire_state(&params, "state")?;
                    let Some(result) = result else { continue };
                    let simplified = result
                        .get("state")
                        .ok_or_else(|| ClientError::BadPayload("simplify without state".into()))
                        .and_then(|v| split_cterm(&from_wire(v)?))?;
                    replay.simplifications.insert(state.hash().to_string(), simplified);
                }
                _ => {}
            }
        }
        Ok(replay)
    }

    fn missing(&self, what: String) -> Result<(), ClientError> {
        if self.strict {
            return Err(ClientError::BadPayload(format!("no recorded response for {what}")));
        }
        Ok(())
    }
}

fn implies_key(antecedent: &CTerm, consequent: &CTerm) -> ImpliesKey {
    (antecedent.hash().to_string(), consequent.hash().to_string())
}

/// Parse a constrained term out of a request parameter, stripping the
/// existential binders `implies` wraps around its consequent.
fn wire_state(params: &Value, field: &str) -> Result<CTerm, ClientError> {
    let wire = params
        .get(field)
        .ok_or_else(|| ClientError::BadPayload(format!("request without `{field}`")))?;
    let mut term: RcTerm = from_wire(wire)?;
    loop {
        let next = match term.as_ref() {
            Term::App { label, args } if label.name == ML_EXISTS && args.len() == 2 => {
                args[1].clone()
            }
            _ => break,
        };
        term = next;
    }
    split_cterm(&term)
}

impl ExecutionBackend for ReplayBackend {
    async fn execute(
        &mut self,
        cterm: &CTerm,
        _opts: &ExecuteOpts,
    ) -> Result<ExecuteResult, ClientError> {
        self.calls.push("execute".to_string());
        if let Some(queue) = self.executes.get_mut(cterm.hash()) {
            if let Some(result) = queue.pop_front() {
                return Ok(result);
            }
        }
        self.missing(format!("execute on {}", cterm.hash()))?;
        // a backend with nothing to say is stuck in place
        Ok(ExecuteResult::Stuck { state: cterm.clone(), depth: 0, rules: Vec::new() })
    }

    async fn simplify(&mut self, cterm: &CTerm) -> Result<(CTerm, Vec<LogEntry>), ClientError> {
        self.calls.push("simplify".to_string());
        if let Some(simplified) = self.simplifications.get(cterm.hash()) {
            return Ok((simplified.clone(), Vec::new()));
        }
        self.missing(format!("simplify on {}", cterm.hash()))?;
        Ok((cterm.clone(), Vec::new()))
    }

    async fn implies(
        &mut self,
        antecedent: &CTerm,
        consequent: &CTerm,
    ) -> Result<Option<CSubst>, ClientError> {
        self.calls.push("implies".to_string());
        let key = implies_key(antecedent, consequent);
        if let Some(reason) = self.undecided.get(&key) {
            return Err(ClientError::Rpc(RpcError::ImplicationFailed(reason.clone())));
        }
        if let Some(witness) = self.implications.get(&key) {
            return Ok(witness.clone());
        }
        self.missing(format!("implies on {} -> {}", key.0, key.1))?;
        Ok(None)
    }

    async fn get_model(
        &mut self,
        cterm: &CTerm,
        _module_name: Option<&str>,
    ) -> Result<GetModelResult, ClientError> {
        self.calls.push("get-model".to_string());
        if let Some(result) = self.models.get(cterm.hash()) {
            return Ok(match result {
                GetModelResult::Sat(s) => GetModelResult::Sat(s.clone()),
                GetModelResult::Unsat => GetModelResult::Unsat,
                GetModelResult::Unknown => GetModelResult::Unknown,
            });
        }
        self.missing(format!("get-model on {}", cterm.hash()))?;
        Ok(GetModelResult::Unknown)
    }

    async fn add_module(&mut self, name: &str, axioms: Vec<Value>) -> Result<(), ClientError> {
        self.calls.push("add-module".to_string());
        self.modules.push((name.to_string(), axioms));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{int_token, ml_equals, Term};

    fn state(i: i64) -> CTerm {
        CTerm::from_config(Term::apply("<top>", vec![int_token(i)]))
    }

    #[tokio::test]
    async fn scripted_execute_plays_in_order() {
        let mut backend = ReplayBackend::new().strict();
        let s0 = state(0);
        let s1 = state(1);
        backend.on_execute(
            &s0,
            ExecuteResult::DepthBound { state: s1.clone(), depth: 1, rules: vec![] },
        );
        backend.on_execute(&s0, ExecuteResult::Stuck { state: s0.clone(), depth: 0, rules: vec![] });

        let opts = ExecuteOpts::default();
        assert!(matches!(
            backend.execute(&s0, &opts).await.unwrap(),
            ExecuteResult::DepthBound { .. }
        ));
        assert!(matches!(
            backend.execute(&s0, &opts).await.unwrap(),
            ExecuteResult::Stuck { .. }
        ));
        // the script is exhausted
        assert!(backend.execute(&s0, &opts).await.is_err());
    }

    #[tokio::test]
    async fn lenient_mode_degrades_gracefully() {
        let mut backend = ReplayBackend::new();
        let s = state(5);
        assert!(matches!(
            backend.execute(&s, &ExecuteOpts::default()).await.unwrap(),
            ExecuteResult::Stuck { depth: 0, .. }
        ));
        let (simplified, _) = backend.simplify(&s).await.unwrap();
        assert_eq!(simplified, s);
        assert!(backend.implies(&s, &state(6)).await.unwrap().is_none());
        assert!(matches!(
            backend.get_model(&s, None).await.unwrap(),
            GetModelResult::Unknown
        ));
    }

    #[tokio::test]
    async fn undecided_implications_surface_as_rpc_errors() {
        let mut backend = ReplayBackend::new();
        let (a, b) = (state(1), state(2));
        backend.on_implies_undecided(&a, &b, "smt timeout");
        match backend.implies(&a, &b).await.unwrap_err() {
            ClientError::Rpc(RpcError::ImplicationFailed(reason)) => {
                assert!(reason.contains("smt"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn rebuilds_from_wire_transcript() {
        use crate::client::cterm_term;
        use crate::term::to_wire;
        use serde_json::json;

        let s0 = state(0);
        let s1 = CTerm::new(
            Term::apply("<top>", vec![Term::var("X")]),
            [ml_equals(Term::var("X"), int_token(1))],
        );
        let transcript = Transcript {
            entries: vec![crate::rpc::TranscriptEntry {
                method: "execute".to_string(),
                request: json!({
                    "jsonrpc": "2.0", "id": 1, "method": "execute",
                    "params": {"state": to_wire(&cterm_term(&s0))},
                }),
                response: json!({
                    "jsonrpc": "2.0", "id": 1,
                    "result": {
                        "reason": "stuck",
                        "state": {"term": to_wire(&cterm_term(&s1))},
                        "depth": 4,
                    },
                }),
            }],
        };

        let mut backend = ReplayBackend::from_transcript(&transcript).unwrap();
        match backend.execute(&s0, &ExecuteOpts::default()).await.unwrap() {
            ExecuteResult::Stuck { state, depth, .. } => {
                assert_eq!(depth, 4);
                assert_eq!(state, s1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
