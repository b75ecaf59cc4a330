use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::model::{CallSite, Function};
use crate::polymorph::PolymorphTable;

/// Whole-program call graph, keyed by function USR.
///
/// The map owns every function; call sites are owned by their enclosing
/// function and back-edges are USR strings, so the ownership graph stays
/// acyclic and serialization is a plain forward walk.
#[derive(Debug, Default)]
pub(crate) struct CallGraph {
    functions: BTreeMap<String, Function>,
}

impl CallGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Install one function loaded from a call-graph fragment.
    ///
    /// When a polymorph table is supplied, every directly-extracted call site
    /// additionally spawns one synthetic site per transitive overrider of its
    /// callee. Duplicate USRs from overlapping TU includes merge by union.
    pub(crate) fn install(&mut self, mut function: Function, polymorph: Option<&PolymorphTable>) {
        function.throw.extend(function.direct_throw.iter().cloned());
        if let Some(table) = polymorph {
            expand_virtual_calls(&mut function, table);
        }
        match self.functions.entry(function.usr.clone()) {
            Entry::Occupied(mut slot) => merge_duplicate(slot.get_mut(), function),
            Entry::Vacant(slot) => {
                slot.insert(function);
            }
        }
    }

    /// Populate `callers` back-edges from the forward call sites.
    ///
    /// Call sites whose callee USR is not in the map are external and are
    /// left alone; they contribute no throws.
    pub(crate) fn link_callers(&mut self) {
        let mut edges: Vec<(String, String)> = Vec::new();
        for (caller_usr, function) in &self.functions {
            for site in &function.call_sites {
                if self.functions.contains_key(&site.callee_usr) {
                    edges.push((site.callee_usr.clone(), caller_usr.clone()));
                }
            }
        }
        for (callee_usr, caller_usr) in edges {
            if let Some(callee) = self.functions.get_mut(&callee_usr) {
                callee.callers.insert(caller_usr);
            }
        }
    }

    pub(crate) fn get(&self, usr: &str) -> Option<&Function> {
        self.functions.get(usr)
    }

    pub(crate) fn get_mut(&mut self, usr: &str) -> Option<&mut Function> {
        self.functions.get_mut(usr)
    }

    pub(crate) fn contains(&self, usr: &str) -> bool {
        self.functions.contains_key(usr)
    }

    pub(crate) fn len(&self) -> usize {
        self.functions.len()
    }

    pub(crate) fn functions(&self) -> impl Iterator<Item = (&String, &Function)> {
        self.functions.iter()
    }

    pub(crate) fn call_site_count(&self) -> usize {
        self.functions
            .values()
            .map(|function| function.call_sites.len())
            .sum()
    }
}

fn expand_virtual_calls(function: &mut Function, table: &PolymorphTable) {
    let mut synthetic = Vec::new();
    for site in &function.call_sites {
        // Synthetic sites are never re-expanded; their overriders are already
        // in the origin's transitive closure.
        if !site.expand_origin.is_empty() {
            continue;
        }
        for overrider in table.transitive_overriders(&site.callee_usr) {
            synthetic.push(CallSite {
                callee_usr: overrider.name,
                callee_sname: overrider.sname,
                loc: site.loc.clone(),
                expand_origin: site.callee_usr.clone(),
                catch_set: site.catch_set.clone(),
            });
        }
    }
    function.call_sites.extend(synthetic);
}

// Union-merge for duplicate fragments from overlapping TU includes; scalar
// fields keep the first-seen value.
fn merge_duplicate(existing: &mut Function, incoming: Function) {
    existing.direct_throw.extend(incoming.direct_throw);
    existing.throw.extend(incoming.throw);
    existing.call_sites.extend(incoming.call_sites);
    existing.callers.extend(incoming.callers);
    if existing.sname.is_empty() {
        existing.sname = incoming.sname;
    }
    if existing.loc.is_empty() {
        existing.loc = incoming.loc;
    }
    if existing.tag.is_empty() {
        existing.tag = incoming.tag;
    }
}
