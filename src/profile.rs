use std::collections::BTreeMap;

use serde::Serialize;

use crate::contexts::{Context, Specificity};
use crate::graph::CallGraph;
use crate::handlers;
use crate::model::{scope_name, simple_name};

/// Catch/throw totals for one context level.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct ContextProfile {
    pub(crate) context: u32,
    pub(crate) thrown: u64,
    pub(crate) caught: u64,
    pub(crate) rate: String,
}

impl ContextProfile {
    fn new(context: Context, thrown: u64, caught: u64) -> Self {
        let rate = if thrown == 0 {
            "-".to_string()
        } else {
            format!("{:.2}", caught as f64 / thrown as f64)
        };
        Self {
            context: context.compact(),
            thrown,
            caught,
            rate,
        }
    }
}

/// Flattened call-site view over the profiled universe.
struct Site {
    caller_usr: String,
    caller_name: String,
    caller_scope: String,
    callee_usr: String,
    callee_name: String,
    callee_scope: String,
    n_thrown: usize,
    n_caught: usize,
}

/// Profile catch effectiveness across all 17 context levels.
///
/// The universe is every call site whose callee resolves in the graph with a
/// non-empty throw-set, owned by a non-system function.
pub(crate) fn profile(graph: &CallGraph) -> Vec<ContextProfile> {
    let sites = collect_universe(graph);
    let indices = Indices::build(&sites);
    Context::all()
        .into_iter()
        .map(|context| match context {
            Context::PerSite => per_site_level(&sites),
            Context::Group { caller, callee } => {
                group_level(context, caller, callee, &sites, &indices)
            }
        })
        .collect()
}

/// Number of call sites the profiler operates on.
pub(crate) fn universe_size(graph: &CallGraph) -> usize {
    collect_universe(graph).len()
}

fn collect_universe(graph: &CallGraph) -> Vec<Site> {
    let mut sites = Vec::new();
    for (caller_usr, function) in graph.functions() {
        if function.is_system() {
            continue;
        }
        for call_site in &function.call_sites {
            let Some(callee) = graph.get(&call_site.callee_usr) else {
                continue;
            };
            if callee.throw.is_empty() {
                continue;
            }
            sites.push(Site {
                caller_usr: caller_usr.clone(),
                caller_name: simple_name(&function.sname).to_string(),
                caller_scope: scope_name(&function.sname).to_string(),
                callee_usr: call_site.callee_usr.clone(),
                callee_name: simple_name(&callee.sname).to_string(),
                callee_scope: scope_name(&callee.sname).to_string(),
                n_thrown: callee.throw.len(),
                n_caught: handlers::caught_count(&callee.throw, &call_site.catch_set),
            });
        }
    }
    sites
}

/// Site indices keyed by each grouping attribute.
struct Indices {
    by_caller: BTreeMap<String, Vec<usize>>,
    by_caller_name: BTreeMap<String, Vec<usize>>,
    by_caller_scope: BTreeMap<String, Vec<usize>>,
    by_callee: BTreeMap<String, Vec<usize>>,
    by_callee_name: BTreeMap<String, Vec<usize>>,
    by_callee_scope: BTreeMap<String, Vec<usize>>,
}

impl Indices {
    fn build(sites: &[Site]) -> Self {
        let mut indices = Self {
            by_caller: BTreeMap::new(),
            by_caller_name: BTreeMap::new(),
            by_caller_scope: BTreeMap::new(),
            by_callee: BTreeMap::new(),
            by_callee_name: BTreeMap::new(),
            by_callee_scope: BTreeMap::new(),
        };
        for (index, site) in sites.iter().enumerate() {
            indices
                .by_caller
                .entry(site.caller_usr.clone())
                .or_default()
                .push(index);
            indices
                .by_caller_name
                .entry(site.caller_name.clone())
                .or_default()
                .push(index);
            indices
                .by_caller_scope
                .entry(site.caller_scope.clone())
                .or_default()
                .push(index);
            indices
                .by_callee
                .entry(site.callee_usr.clone())
                .or_default()
                .push(index);
            indices
                .by_callee_name
                .entry(site.callee_name.clone())
                .or_default()
                .push(index);
            indices
                .by_callee_scope
                .entry(site.callee_scope.clone())
                .or_default()
                .push(index);
        }
        indices
    }

    fn caller_group(&self, specificity: Specificity, site: &Site) -> Option<&[usize]> {
        let group = match specificity {
            Specificity::Exact => self.by_caller.get(&site.caller_usr),
            Specificity::Name => self.by_caller_name.get(&site.caller_name),
            Specificity::Scope => self.by_caller_scope.get(&site.caller_scope),
            Specificity::Any => None,
        };
        group.map(Vec::as_slice)
    }

    fn callee_group(&self, specificity: Specificity, site: &Site) -> Option<&[usize]> {
        let group = match specificity {
            Specificity::Exact => self.by_callee.get(&site.callee_usr),
            Specificity::Name => self.by_callee_name.get(&site.callee_name),
            Specificity::Scope => self.by_callee_scope.get(&site.callee_scope),
            Specificity::Any => None,
        };
        group.map(Vec::as_slice)
    }
}

// Baseline: one row per site, restricted to multi-throw callees with at
// least one catch so the ratio is informative.
fn per_site_level(sites: &[Site]) -> ContextProfile {
    let mut thrown = 0u64;
    let mut caught = 0u64;
    for site in sites {
        if site.n_thrown >= 2 && site.n_caught > 0 {
            thrown += site.n_thrown as u64;
            caught += site.n_caught as u64;
        }
    }
    ContextProfile::new(Context::PerSite, thrown, caught)
}

fn group_level(
    context: Context,
    caller: Specificity,
    callee: Specificity,
    sites: &[Site],
    indices: &Indices,
) -> ContextProfile {
    let mut visited = vec![false; sites.len()];
    let mut thrown = 0u64;
    let mut caught = 0u64;
    for index in 0..sites.len() {
        if visited[index] {
            continue;
        }
        let mut group = group_members(caller, callee, &sites[index], indices, sites.len());
        for &member in &group {
            visited[member] = true;
        }
        if group.len() < 2 {
            continue;
        }
        let caught_members: Vec<usize> = group
            .iter()
            .copied()
            .filter(|&member| sites[member].n_caught > 0)
            .collect();
        if caught_members.is_empty() {
            continue;
        }
        // A lone caught site would only be counted against itself; drop it
        // and account for the rest of the group.
        if caught_members.len() == 1 {
            group.retain(|&member| member != caught_members[0]);
        }
        for &member in &group {
            thrown += sites[member].n_thrown as u64;
            caught += sites[member].n_caught as u64;
        }
    }
    ContextProfile::new(context, thrown, caught)
}

fn group_members(
    caller: Specificity,
    callee: Specificity,
    site: &Site,
    indices: &Indices,
    universe: usize,
) -> Vec<usize> {
    let caller_group = indices.caller_group(caller, site);
    let callee_group = indices.callee_group(callee, site);
    match (caller_group, callee_group) {
        (None, None) => (0..universe).collect(),
        (Some(group), None) | (None, Some(group)) => group.to_vec(),
        (Some(callers), Some(callees)) => intersect_sorted(callers, callees),
    }
}

// Index postings are built in ascending site order, so a merge walk suffices.
fn intersect_sorted(left: &[usize], right: &[usize]) -> Vec<usize> {
    let mut merged = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        match left[i].cmp(&right[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                merged.push(left[i]);
                i += 1;
                j += 1;
            }
        }
    }
    merged
}
