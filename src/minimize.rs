//! Structural graph rewrites: edge lifting, split lifting, minimization.
//!
//! Lifting collapses bookkeeping interior nodes without changing the set of
//! behaviors the graph describes: `lift_edge` merges a straight-line chain
//! `A -> B -> C` into one edge summing depths and concatenating rule labels;
//! `lift_split` pushes a case split up through its incoming edge, so the
//! case analysis happens before the shared rewrite steps. [`Cfg::minimize`]
//! is the fixed point of both and is idempotent.

use std::collections::BTreeSet;

use crate::cfg::{Cfg, CfgError, Edge, NodeId, Split};
use crate::utils::single;

impl Cfg {
    /// Collapse `A -> B -> C` into `A -> C` when `B` has exactly one
    /// incoming and one outgoing edge. `B` is removed.
    pub fn lift_edge(&mut self, id_like: &str) -> Result<(), CfgError> {
        let b = self.resolve(id_like)?;
        let in_edge: Edge = single(self.edges(None, Some(&b)).into_iter().cloned())
            .map_err(|e| CfgError::CannotLift { id: b.clone(), reason: e.to_string() })?;
        let out_edge: Edge = single(self.edges(Some(&b), None).into_iter().cloned())
            .map_err(|e| CfgError::CannotLift { id: b.clone(), reason: e.to_string() })?;
        if in_edge.source == b || out_edge.target == b {
            return Err(CfgError::CannotLift { id: b, reason: "loop edge".to_string() });
        }

        self.remove_node(b.as_str())?;
        let mut rules = in_edge.rules;
        rules.extend(out_edge.rules);
        self.create_edge(&in_edge.source, &out_edge.target, in_edge.depth + out_edge.depth, rules)?;
        Ok(())
    }

    /// Push the split at `S` through its single incoming edge `A -> S`:
    /// each branch becomes `A_i -> T_i` with the original edge's depth and
    /// rules, and `A` splits into the `A_i` under the same witnesses.
    ///
    /// Refused when a branch condition mentions a variable that is not free
    /// in `A` (the condition would talk about state the edge introduced).
    pub fn lift_split(&mut self, id_like: &str) -> Result<(), CfgError> {
        let s = self.resolve(id_like)?;
        let in_edge: Edge = single(self.edges(None, Some(&s)).into_iter().cloned())
            .map_err(|e| CfgError::CannotLift { id: s.clone(), reason: e.to_string() })?;
        let split: Split = single(self.splits(Some(&s), None).into_iter().cloned())
            .map_err(|e| CfgError::CannotLift { id: s.clone(), reason: e.to_string() })?;

        let a = in_edge.source.clone();
        let a_cterm = match self.get_node(&a) {
            Some(node) => node.cterm.clone(),
            None => return Err(CfgError::UnknownNode(a.to_string())),
        };

        let known: BTreeSet<String> = a_cterm.free_vars();
        let mut condition_vars: BTreeSet<String> = BTreeSet::new();
        for (_, csubst) in &split.targets {
            condition_vars.extend(crate::term::free_vars(&csubst.constraint()));
            for (name, image) in csubst.subst.iter() {
                condition_vars.insert(name.clone());
                condition_vars.extend(crate::term::free_vars(image));
            }
        }
        if !condition_vars.is_subset(&known) {
            return Err(CfgError::CannotLift {
                id: s,
                reason: "branching on freshly introduced variables".to_string(),
            });
        }

        self.remove_node(s.as_str())?;

        let mut lifted: Vec<(NodeId, crate::cterm::CSubst)> = Vec::with_capacity(split.targets.len());
        for (target, csubst) in &split.targets {
            let branch_cterm = csubst.apply(&a_cterm);
            let a_i = self.get_or_create_node(branch_cterm).id.clone();
            self.create_edge(&a_i, target, in_edge.depth, in_edge.rules.clone())?;
            lifted.push((a_i, csubst.clone()));
        }
        self.create_split(&a, lifted)?;
        Ok(())
    }

    /// Lift edges everywhere possible; true if anything changed.
    pub fn lift_edges(&mut self) -> bool {
        let mut changed = false;
        loop {
            let candidate = self
                .nodes()
                .map(|n| n.id.clone())
                .find(|id| self.edge_liftable(id));
            match candidate {
                Some(id) => {
                    if self.lift_edge(id.as_str()).is_err() {
                        break;
                    }
                    changed = true;
                }
                None => break,
            }
        }
        changed
    }

    /// Lift splits everywhere possible; true if anything changed.
    pub fn lift_splits(&mut self) -> bool {
        let mut changed = false;
        loop {
            let candidate = self
                .nodes()
                .map(|n| n.id.clone())
                .find(|id| self.split_liftable(id));
            match candidate {
                Some(id) => {
                    if self.lift_split(id.as_str()).is_err() {
                        break;
                    }
                    changed = true;
                }
                None => break,
            }
        }
        changed
    }

    /// Minimize the graph: the fixed point of edge and split lifting.
    pub fn minimize(&mut self) {
        loop {
            let edges_changed = self.lift_edges();
            let splits_changed = self.lift_splits();
            if !edges_changed && !splits_changed {
                break;
            }
        }
    }

    fn edge_liftable(&self, id: &NodeId) -> bool {
        let in_edges = self.edges(None, Some(id));
        let Ok(in_edge) = single(in_edges.into_iter()) else {
            return false;
        };
        let Some(out_edge) = self.edge(id) else {
            return false;
        };
        in_edge.source != *id && out_edge.target != *id
    }

    fn split_liftable(&self, id: &NodeId) -> bool {
        let Ok(in_edge) = single(self.edges(None, Some(id)).into_iter()) else {
            return false;
        };
        let Some(split) = self.splits(Some(id), None).into_iter().next() else {
            return false;
        };
        let Some(a) = self.get_node(&in_edge.source) else {
            return false;
        };
        let known = a.cterm.free_vars();
        split.targets.iter().all(|(_, csubst)| {
            let mut vars = crate::term::free_vars(&csubst.constraint());
            for (name, image) in csubst.subst.iter() {
                vars.insert(name.clone());
                vars.extend(crate::term::free_vars(image));
            }
            vars.is_subset(&known)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Cfg;
    use crate::cterm::{CSubst, CTerm};
    use crate::term::{int_token, ml_equals_true, RcTerm, Term};

    fn x() -> RcTerm {
        Term::var("X")
    }

    fn y() -> RcTerm {
        Term::var("Y")
    }

    fn x_ge_0() -> RcTerm {
        ml_equals_true(Term::apply("_>=Int_", vec![x(), int_token(0)]))
    }

    fn x_lt_0() -> RcTerm {
        ml_equals_true(Term::apply("_<Int_", vec![x(), int_token(0)]))
    }

    fn y_ge_0() -> RcTerm {
        ml_equals_true(Term::apply("_>=Int_", vec![y(), int_token(0)]))
    }

    fn y_lt_0() -> RcTerm {
        ml_equals_true(Term::apply("_<Int_", vec![y(), int_token(0)]))
    }

    /// Chain nodes share the free variable X but differ in a counter token.
    fn chain(i: i64) -> CTerm {
        CTerm::from_config(Term::apply("<top>", vec![x(), int_token(i)]))
    }

    fn id(cterm: &CTerm) -> crate::cfg::NodeId {
        crate::cfg::NodeId::of(cterm)
    }

    #[test]
    fn lift_edge_sums_depth_and_concatenates_rules() {
        //  1 --25: r1,r2--> 2 --30: r3,r4--> 3
        let mut cfg = Cfg::new();
        let (n1, n2, n3) = (chain(1), chain(2), chain(3));
        for n in [&n1, &n2, &n3] {
            cfg.get_or_create_node(n.clone());
        }
        cfg.create_edge(&id(&n1), &id(&n2), 25, vec!["r1".into(), "r2".into()]).unwrap();
        cfg.create_edge(&id(&n2), &id(&n3), 30, vec!["r3".into(), "r4".into()]).unwrap();

        cfg.lift_edge(id(&n2).as_str()).unwrap();

        assert!(cfg.get_node(&id(&n2)).is_none());
        let edge = cfg.edge(&id(&n1)).unwrap();
        assert_eq!(edge.target, id(&n3));
        assert_eq!(edge.depth, 55);
        assert_eq!(edge.rules, vec!["r1", "r2", "r3", "r4"]);
    }

    #[test]
    fn impossible_lifts_are_refused() {
        let mut cfg = Cfg::new();
        let (n1, n2) = (chain(1), chain(2));
        cfg.get_or_create_node(n1.clone());
        cfg.get_or_create_node(n2.clone());
        cfg.create_edge(&id(&n1), &id(&n2), 1, vec![]).unwrap();

        // no out edge at 2, no in edge at 1
        assert!(matches!(
            cfg.lift_edge(id(&n2).as_str()),
            Err(CfgError::CannotLift { .. })
        ));
        assert!(matches!(
            cfg.lift_edge(id(&n1).as_str()),
            Err(CfgError::CannotLift { .. })
        ));
        assert!(matches!(
            cfg.lift_split(id(&n1).as_str()),
            Err(CfgError::CannotLift { .. })
        ));
    }

    #[test]
    fn lift_split_pushes_case_analysis_up() {
        //  1 --55--> 3 --[x>=0 -> 4 | x<0 -> 5]
        let mut cfg = Cfg::new();
        let n1 = chain(1);
        let n3 = chain(3);
        let n4 = chain(3).add_constraint(x_ge_0());
        let n5 = chain(3).add_constraint(x_lt_0());
        for n in [&n1, &n3, &n4, &n5] {
            cfg.get_or_create_node(n.clone());
        }
        cfg.create_edge(&id(&n1), &id(&n3), 55, vec!["r1".into()]).unwrap();
        cfg.create_split(
            &id(&n3),
            vec![
                (id(&n4), CSubst::from_constraints([x_ge_0()])),
                (id(&n5), CSubst::from_constraints([x_lt_0()])),
            ],
        )
        .unwrap();

        cfg.lift_split(id(&n3).as_str()).unwrap();

        assert!(cfg.get_node(&id(&n3)).is_none());

        // new branch nodes are the source under the extra constraints
        let a_ge = chain(1).add_constraint(x_ge_0());
        let a_lt = chain(1).add_constraint(x_lt_0());
        assert!(cfg.get_node(&id(&a_ge)).is_some());
        assert!(cfg.get_node(&id(&a_lt)).is_some());

        let split = cfg.splits(Some(&id(&n1)), None)[0].clone();
        assert_eq!(split.target_ids(), vec![id(&a_ge), id(&a_lt)]);

        let edge_ge = cfg.edge(&id(&a_ge)).unwrap();
        assert_eq!(edge_ge.target, id(&n4));
        assert_eq!(edge_ge.depth, 55);
        assert_eq!(edge_ge.rules, vec!["r1"]);
    }

    #[test]
    fn lift_split_refuses_fresh_variables() {
        // the split conditions mention Y, which node 1 does not know about
        let mut cfg = Cfg::new();
        let n1 = chain(1);
        let n6 = chain(6);
        let n8 = chain(6).add_constraint(y_ge_0());
        let n9 = chain(6).add_constraint(y_lt_0());
        for n in [&n1, &n6, &n8, &n9] {
            cfg.get_or_create_node(n.clone());
        }
        cfg.create_edge(&id(&n1), &id(&n6), 10, vec![]).unwrap();
        cfg.create_split(
            &id(&n6),
            vec![
                (id(&n8), CSubst::from_constraints([y_ge_0()])),
                (id(&n9), CSubst::from_constraints([y_lt_0()])),
            ],
        )
        .unwrap();

        let err = cfg.lift_split(id(&n6).as_str()).unwrap_err();
        match err {
            CfgError::CannotLift { reason, .. } => {
                assert!(reason.contains("freshly introduced"))
            }
            other => panic!("unexpected error: {other}"),
        }
        // refused lifts leave the graph untouched
        assert!(cfg.get_node(&id(&n6)).is_some());
    }

    /// A chain into a split whose branches each continue with chains, one
    /// of them splitting again.
    fn build_two_level_graph() -> (Cfg, Vec<CTerm>) {
        //                            /-- y>=0 --> t8
        //      /-- x>=0 --> c4 --> s6
        //  1 -chain- s3              \-- y<0  --> t9
        //      \-- x<0  --> c5 --> t7
        let mut cfg = Cfg::new();
        let n1 = chain(1);
        let n2 = chain(2);
        let s3 = CTerm::from_config(Term::apply("<top>", vec![x(), y(), int_token(3)]));
        let c4 = s3.add_constraint(x_ge_0());
        let c5 = s3.add_constraint(x_lt_0());
        let s6 = CTerm::from_config(Term::apply("<top>", vec![x(), y(), int_token(6)]))
            .add_constraint(x_ge_0());
        let t7 = CTerm::from_config(Term::apply("<top>", vec![x(), y(), int_token(7)]))
            .add_constraint(x_lt_0());
        let t8 = s6.add_constraint(y_ge_0());
        let t9 = s6.add_constraint(y_lt_0());

        let all = vec![n1.clone(), n2.clone(), s3.clone(), c4.clone(), c5.clone(), s6.clone(), t7.clone(), t8.clone(), t9.clone()];
        for n in &all {
            cfg.get_or_create_node(n.clone());
        }
        cfg.create_edge(&id(&n1), &id(&n2), 5, vec!["r1".into()]).unwrap();
        cfg.create_edge(&id(&n2), &id(&s3), 10, vec!["r2".into()]).unwrap();
        cfg.create_split(
            &id(&s3),
            vec![
                (id(&c4), CSubst::from_constraints([x_ge_0()])),
                (id(&c5), CSubst::from_constraints([x_lt_0()])),
            ],
        )
        .unwrap();
        cfg.create_edge(&id(&c4), &id(&s6), 25, vec!["r5".into()]).unwrap();
        cfg.create_edge(&id(&c5), &id(&t7), 30, vec!["r6".into()]).unwrap();
        cfg.create_split(
            &id(&s6),
            vec![
                (id(&t8), CSubst::from_constraints([y_ge_0()])),
                (id(&t9), CSubst::from_constraints([y_lt_0()])),
            ],
        )
        .unwrap();
        (cfg, all)
    }

    #[test]
    fn minimize_reaches_a_fixed_point() {
        let (mut cfg, nodes) = build_two_level_graph();
        let n1 = &nodes[0];

        cfg.minimize();

        // the entry chain has been folded into the first split
        let split = cfg.splits(Some(&id(n1)), None);
        assert_eq!(split.len(), 1);
        assert_eq!(split[0].targets.len(), 2);

        // all branch conditions now sit directly under node 1
        let a_ge = n1.add_constraint(x_ge_0());
        let a_lt = n1.add_constraint(x_lt_0());
        assert_eq!(split[0].target_ids(), vec![id(&a_ge), id(&a_lt)]);

        // the x<0 branch is one straight edge to its terminal now
        let t7 = &nodes[6];
        let edge = cfg.edge(&id(&a_lt)).unwrap();
        assert_eq!(edge.target, id(t7));
        assert_eq!(edge.depth, 45);
        assert_eq!(edge.rules, vec!["r1", "r2", "r6"]);

        // idempotent
        let before = cfg.to_json();
        cfg.minimize();
        assert_eq!(cfg.to_json(), before);
    }
}
