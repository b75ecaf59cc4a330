use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// USR of the `catch (...)` wildcard handler.
pub(crate) const WILDCARD_USR: &str = "...";

/// Exception type keyed by its compiler-assigned USR.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Ex {
    #[serde(rename = "USR")]
    pub(crate) usr: String,
    #[serde(rename = "Loc", default)]
    pub(crate) loc: String,
    #[serde(rename = "Parent", default)]
    pub(crate) parents: BTreeSet<String>,
}

// Identity is the USR alone. Overlapping extractions of the same type then
// converge in a set, and the first-seen loc stays canonical.
impl PartialEq for Ex {
    fn eq(&self, other: &Self) -> bool {
        self.usr == other.usr
    }
}

impl Eq for Ex {}

impl PartialOrd for Ex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.usr.cmp(&other.usr)
    }
}

/// Call site inside a function body, with the catch set of its enclosing handlers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct CallSite {
    #[serde(rename = "USR")]
    pub(crate) callee_usr: String,
    #[serde(rename = "SName", default)]
    pub(crate) callee_sname: String,
    #[serde(rename = "Loc", default)]
    pub(crate) loc: String,
    /// USR of the originally-extracted callee when this site was synthesized
    /// by virtual expansion; empty for directly-extracted sites.
    #[serde(rename = "Expand", default)]
    pub(crate) expand_origin: String,
    #[serde(rename = "Catch", default)]
    pub(crate) catch_set: BTreeSet<Ex>,
}

// Identity is (callee USR, location). Synthetic sites from virtual expansion
// share the location and differ in callee, so re-expansion is a no-op.
impl PartialEq for CallSite {
    fn eq(&self, other: &Self) -> bool {
        self.callee_usr == other.callee_usr && self.loc == other.loc
    }
}

impl Eq for CallSite {}

impl PartialOrd for CallSite {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CallSite {
    fn cmp(&self, other: &Self) -> Ordering {
        self.callee_usr
            .cmp(&other.callee_usr)
            .then_with(|| self.loc.cmp(&other.loc))
    }
}

/// Function node of the whole-program call graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Function {
    #[serde(rename = "USR")]
    pub(crate) usr: String,
    #[serde(rename = "SName", default)]
    pub(crate) sname: String,
    #[serde(rename = "Loc", default)]
    pub(crate) loc: String,
    #[serde(rename = "Tag", default)]
    pub(crate) tag: String,
    #[serde(rename = "DirectThrow", default)]
    pub(crate) direct_throw: BTreeSet<Ex>,
    #[serde(rename = "Throw", default)]
    pub(crate) throw: BTreeSet<Ex>,
    #[serde(rename = "CallSite", default)]
    pub(crate) call_sites: BTreeSet<CallSite>,
    #[serde(rename = "Caller", default)]
    pub(crate) callers: BTreeSet<String>,
}

impl Function {
    /// Functions defined in system headers are skipped as profiler callers.
    pub(crate) fn is_system(&self) -> bool {
        self.tag.contains('S')
    }
}

/// Overriding method recorded under a polymorph entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct DerivedMethod {
    #[serde(rename = "Name")]
    pub(crate) name: String,
    #[serde(rename = "SName", default)]
    pub(crate) sname: String,
}

/// Merged polymorph record: one overridden base method and its known overriders.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct PolyEntry {
    #[serde(rename = "Name")]
    pub(crate) name: String,
    #[serde(rename = "SName", default)]
    pub(crate) sname: String,
    #[serde(rename = "Derived", default)]
    pub(crate) derived: Vec<DerivedMethod>,
}

/// Simple name of a qualified source name: everything after the last `::`.
pub(crate) fn simple_name(sname: &str) -> &str {
    sname.rsplit_once("::").map_or(sname, |(_, name)| name)
}

/// Scope of a qualified source name: everything before the last `::`, or `""`.
pub(crate) fn scope_name(sname: &str) -> &str {
    sname.rsplit_once("::").map_or("", |(scope, _)| scope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ex(usr: &str, loc: &str) -> Ex {
        Ex {
            usr: usr.to_string(),
            loc: loc.to_string(),
            parents: BTreeSet::new(),
        }
    }

    #[test]
    fn ex_identity_is_usr_only() {
        assert_eq!(ex("c:@S@E", "a.cpp:1"), ex("c:@S@E", "b.cpp:9"));
        assert_ne!(ex("c:@S@E", "a.cpp:1"), ex("c:@S@F", "a.cpp:1"));
    }

    #[test]
    fn ex_set_keeps_first_seen_loc() {
        let mut set = BTreeSet::new();
        set.insert(ex("c:@S@E", "first.cpp:1"));
        set.insert(ex("c:@S@E", "second.cpp:2"));

        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().expect("entry").loc, "first.cpp:1");
    }

    #[test]
    fn call_site_identity_is_callee_and_loc() {
        let site = CallSite {
            callee_usr: "c:@F@f#".to_string(),
            callee_sname: "f".to_string(),
            loc: "a.cpp:3".to_string(),
            expand_origin: String::new(),
            catch_set: BTreeSet::new(),
        };
        let mut expanded = site.clone();
        expanded.expand_origin = "c:@F@g#".to_string();

        let mut set = BTreeSet::new();
        set.insert(site);
        set.insert(expanded);

        assert_eq!(set.len(), 1);
    }

    #[test]
    fn qualified_name_splits() {
        assert_eq!(simple_name("A::B::f"), "f");
        assert_eq!(scope_name("A::B::f"), "A::B");
        assert_eq!(simple_name("main"), "main");
        assert_eq!(scope_name("main"), "");
    }

    #[test]
    fn function_wire_names_round_trip() {
        let json = r#"{
            "USR": "c:@F@f#",
            "SName": "f",
            "Loc": "a.cpp:1",
            "Tag": "",
            "DirectThrow": [{"USR": "c:@S@E", "Loc": "e.h:2", "Parent": ["c:@S@Base"]}],
            "Throw": [],
            "CallSite": [{"USR": "c:@F@g#", "SName": "g", "Loc": "a.cpp:4", "Expand": "", "Catch": []}],
            "Caller": []
        }"#;
        let function: Function = serde_json::from_str(json).expect("function record");

        assert_eq!(function.usr, "c:@F@f#");
        assert_eq!(function.direct_throw.len(), 1);
        let thrown = function.direct_throw.iter().next().expect("throw entry");
        assert!(thrown.parents.contains("c:@S@Base"));
        assert_eq!(function.call_sites.len(), 1);

        let value = serde_json::to_value(&function).expect("serialize function");
        assert_eq!(value["USR"], "c:@F@f#");
        assert_eq!(value["CallSite"][0]["SName"], "g");
        assert_eq!(value["DirectThrow"][0]["Parent"][0], "c:@S@Base");
    }
}
