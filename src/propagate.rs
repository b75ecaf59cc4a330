use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::graph::CallGraph;
use crate::handlers;
use crate::model::Ex;

/// Cooperative cancellation flag checked on each worklist dequeue.
#[derive(Clone, Debug, Default)]
pub(crate) struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // Wired up by embedders and tests; the CLI runs to completion.
    #[allow(dead_code)]
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Counters reported by the fixed-point run.
#[derive(Debug, Default)]
pub(crate) struct PropagationStats {
    pub(crate) visits: usize,
    pub(crate) enqueues: usize,
    pub(crate) reconciled: usize,
}

/// Propagate throw-sets to transitive callers until the fixed point.
///
/// The worklist is a LIFO stack seeded with every function that has a
/// non-empty throw-set, in ascending USR order. Throw-sets only grow inside
/// the finite universe of extracted exception types, and a function is
/// re-enqueued only on a strict superset transition, so the loop terminates.
pub(crate) fn propagate(graph: &mut CallGraph, cancel: &CancelToken) -> PropagationStats {
    let mut stats = PropagationStats::default();
    let mut stack: Vec<String> = graph
        .functions()
        .filter(|(_, function)| !function.throw.is_empty())
        .map(|(usr, _)| usr.clone())
        .collect();
    let mut visited: BTreeMap<String, BTreeSet<Ex>> = BTreeMap::new();

    while let Some(usr) = stack.pop() {
        if cancel.is_cancelled() {
            break;
        }
        let Some(callee) = graph.get(&usr) else {
            continue;
        };
        if visited
            .get(&usr)
            .is_some_and(|snapshot| *snapshot == callee.throw)
        {
            continue;
        }
        visited.insert(usr.clone(), callee.throw.clone());
        stats.visits += 1;

        let throw = callee.throw.clone();
        let callers: Vec<String> = callee.callers.iter().cloned().collect();
        for caller_usr in callers {
            let Some(caller) = graph.get(&caller_usr) else {
                continue;
            };
            let mut escaped: BTreeSet<Ex> = BTreeSet::new();
            for site in caller.call_sites.iter().filter(|s| s.callee_usr == usr) {
                escaped.extend(handlers::filter(&throw, &site.catch_set));
            }
            if escaped.is_subset(&caller.throw) {
                continue;
            }
            let caller = graph.get_mut(&caller_usr).expect("caller present in map");
            caller.throw.extend(escaped);
            stack.push(caller_usr);
            stats.enqueues += 1;
        }
    }

    stats.reconciled = reconcile_expansions(graph);
    stats
}

/// Fold overrider throw-sets back into the declared virtual base.
///
/// The worklist delivers an overrider's throws to its callers through the
/// synthetic sites, but the base method's own node may never see them; this
/// pass makes the declared base reflect its overriders.
fn reconcile_expansions(graph: &mut CallGraph) -> usize {
    let mut merges: Vec<(String, BTreeSet<Ex>)> = Vec::new();
    for (_, function) in graph.functions() {
        for site in &function.call_sites {
            if site.expand_origin.is_empty() || !graph.contains(&site.expand_origin) {
                continue;
            }
            if let Some(derived) = graph.get(&site.callee_usr) {
                if !derived.throw.is_empty() {
                    merges.push((site.expand_origin.clone(), derived.throw.clone()));
                }
            }
        }
    }
    let mut reconciled = 0;
    for (origin_usr, throw) in merges {
        if let Some(origin) = graph.get_mut(&origin_usr) {
            let before = origin.throw.len();
            origin.throw.extend(throw);
            reconciled += origin.throw.len() - before;
        }
    }
    reconciled
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::model::{CallSite, Function, WILDCARD_USR};
    use crate::polymorph::{ClassRecord, MethodRecord, OverrideRecord, PolymorphTable};

    fn ex(usr: &str) -> Ex {
        Ex {
            usr: usr.to_string(),
            loc: String::new(),
            parents: BTreeSet::new(),
        }
    }

    fn ex_with_parents(usr: &str, parents: &[&str]) -> Ex {
        Ex {
            usr: usr.to_string(),
            loc: String::new(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn site(callee: &str, loc: &str, catch_set: Vec<Ex>) -> CallSite {
        CallSite {
            callee_usr: callee.to_string(),
            callee_sname: callee.to_string(),
            loc: loc.to_string(),
            expand_origin: String::new(),
            catch_set: catch_set.into_iter().collect(),
        }
    }

    fn function(usr: &str, direct_throw: Vec<Ex>, call_sites: Vec<CallSite>) -> Function {
        Function {
            usr: usr.to_string(),
            sname: usr.to_string(),
            loc: String::new(),
            tag: String::new(),
            direct_throw: direct_throw.into_iter().collect(),
            throw: BTreeSet::new(),
            call_sites: call_sites.into_iter().collect(),
            callers: BTreeSet::new(),
        }
    }

    fn throws(graph: &CallGraph, usr: &str) -> Vec<String> {
        graph
            .get(usr)
            .expect("function")
            .throw
            .iter()
            .map(|e| e.usr.clone())
            .collect()
    }

    #[test]
    fn propagates_through_uncaught_chain_and_stops_at_handler() {
        let mut graph = CallGraph::new();
        graph.install(function("f", vec![ex("E")], Vec::new()), None);
        graph.install(
            function("g", Vec::new(), vec![site("f", "g.cpp:1", Vec::new())]),
            None,
        );
        graph.install(
            function("h", Vec::new(), vec![site("g", "h.cpp:1", vec![ex("E")])]),
            None,
        );
        graph.link_callers();

        propagate(&mut graph, &CancelToken::new());

        assert_eq!(throws(&graph, "f"), vec!["E"]);
        assert_eq!(throws(&graph, "g"), vec!["E"]);
        assert!(throws(&graph, "h").is_empty());
    }

    #[test]
    fn wildcard_handler_catches_all() {
        let mut graph = CallGraph::new();
        graph.install(function("f", vec![ex("E")], Vec::new()), None);
        graph.install(
            function("g", Vec::new(), vec![site("f", "g.cpp:1", Vec::new())]),
            None,
        );
        graph.install(
            function(
                "h",
                Vec::new(),
                vec![site("g", "h.cpp:1", vec![ex(WILDCARD_USR)])],
            ),
            None,
        );
        graph.link_callers();

        propagate(&mut graph, &CancelToken::new());

        assert!(throws(&graph, "h").is_empty());
    }

    #[test]
    fn parent_chain_handler_catches_derived_type() {
        let mut graph = CallGraph::new();
        graph.install(
            function("f", vec![ex_with_parents("X", &["B", "A"])], Vec::new()),
            None,
        );
        graph.install(
            function("g", Vec::new(), vec![site("f", "g.cpp:1", vec![ex("A")])]),
            None,
        );
        graph.link_callers();

        propagate(&mut graph, &CancelToken::new());

        assert!(throws(&graph, "g").is_empty());
    }

    #[test]
    fn throw_stays_superset_of_direct_throw() {
        let mut graph = CallGraph::new();
        graph.install(function("f", vec![ex("E1")], Vec::new()), None);
        graph.install(
            function(
                "g",
                vec![ex("E2")],
                vec![site("f", "g.cpp:1", vec![ex("E1")])],
            ),
            None,
        );
        graph.link_callers();

        propagate(&mut graph, &CancelToken::new());

        for (_, function) in graph.functions() {
            assert!(function.throw.is_superset(&function.direct_throw));
        }
        assert_eq!(throws(&graph, "g"), vec!["E2"]);
    }

    #[test]
    fn caller_covers_filtered_callee_throws_after_fixed_point() {
        let mut graph = CallGraph::new();
        graph.install(function("f", vec![ex("E1"), ex("E2")], Vec::new()), None);
        graph.install(
            function(
                "g",
                Vec::new(),
                vec![
                    site("f", "g.cpp:1", vec![ex("E1")]),
                    site("f", "g.cpp:9", Vec::new()),
                ],
            ),
            None,
        );
        graph.link_callers();

        propagate(&mut graph, &CancelToken::new());

        let callee_throw = graph.get("f").expect("f").throw.clone();
        let caller = graph.get("g").expect("g");
        for call_site in &caller.call_sites {
            let escaped = handlers::filter(&callee_throw, &call_site.catch_set);
            assert!(escaped.is_subset(&caller.throw));
        }
    }

    #[test]
    fn converges_on_mutual_recursion() {
        let mut graph = CallGraph::new();
        graph.install(
            function("a", vec![ex("E")], vec![site("b", "a.cpp:1", Vec::new())]),
            None,
        );
        graph.install(
            function("b", Vec::new(), vec![site("a", "b.cpp:1", Vec::new())]),
            None,
        );
        graph.link_callers();

        let stats = propagate(&mut graph, &CancelToken::new());

        assert_eq!(throws(&graph, "a"), vec!["E"]);
        assert_eq!(throws(&graph, "b"), vec!["E"]);
        assert!(stats.visits >= 2);
    }

    #[test]
    fn expansion_and_reconciliation_enrich_base_and_caller() {
        let mut table = PolymorphTable::new();
        table.absorb(vec![ClassRecord {
            methods: vec![
                MethodRecord {
                    name: "Circle::area".to_string(),
                    sname: "Circle::area".to_string(),
                    overrides: vec![OverrideRecord {
                        name: "Shape::area".to_string(),
                        sname: "Shape::area".to_string(),
                    }],
                },
                MethodRecord {
                    name: "Square::area".to_string(),
                    sname: "Square::area".to_string(),
                    overrides: vec![OverrideRecord {
                        name: "Shape::area".to_string(),
                        sname: "Shape::area".to_string(),
                    }],
                },
            ],
        }]);

        let mut graph = CallGraph::new();
        graph.install(function("Shape::area", Vec::new(), Vec::new()), None);
        graph.install(function("Circle::area", vec![ex("E1")], Vec::new()), None);
        graph.install(function("Square::area", vec![ex("E2")], Vec::new()), None);
        graph.install(
            function(
                "draw",
                Vec::new(),
                vec![site("Shape::area", "draw.cpp:5", Vec::new())],
            ),
            Some(&table),
        );
        graph.link_callers();

        propagate(&mut graph, &CancelToken::new());

        let mut caller_throws = throws(&graph, "draw");
        caller_throws.sort();
        assert_eq!(caller_throws, vec!["E1", "E2"]);
        let mut base_throws = throws(&graph, "Shape::area");
        base_throws.sort();
        assert_eq!(base_throws, vec!["E1", "E2"]);
    }

    #[test]
    fn cancellation_stops_before_any_visit() {
        let mut graph = CallGraph::new();
        graph.install(function("f", vec![ex("E")], Vec::new()), None);
        graph.install(
            function("g", Vec::new(), vec![site("f", "g.cpp:1", Vec::new())]),
            None,
        );
        graph.link_callers();

        let cancel = CancelToken::new();
        cancel.cancel();
        let stats = propagate(&mut graph, &cancel);

        assert_eq!(stats.visits, 0);
        assert!(throws(&graph, "g").is_empty());
    }
}
