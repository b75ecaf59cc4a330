use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::model::{DerivedMethod, PolyEntry};

/// Class record of a polymorph (IPM) fragment.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ClassRecord {
    #[serde(rename = "Method", default)]
    pub(crate) methods: Vec<MethodRecord>,
}

/// Virtual method declaration with the base methods it overrides.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct MethodRecord {
    #[serde(rename = "Name")]
    pub(crate) name: String,
    #[serde(rename = "SName", default)]
    pub(crate) sname: String,
    #[serde(rename = "Override", default)]
    pub(crate) overrides: Vec<OverrideRecord>,
}

/// Base method referenced by an `Override` entry.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct OverrideRecord {
    #[serde(rename = "Name")]
    pub(crate) name: String,
    #[serde(rename = "SName", default)]
    pub(crate) sname: String,
}

/// Whole-program override table: base method USR to its direct overriders.
#[derive(Debug, Default)]
pub(crate) struct PolymorphTable {
    table: BTreeMap<String, PolyEntry>,
}

impl PolymorphTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Merge one fragment's class records into the table.
    ///
    /// Absorption is commutative and associative over fragments: each override
    /// target gains the declaring method once, deduplicated by USR.
    pub(crate) fn absorb(&mut self, classes: Vec<ClassRecord>) {
        for class in classes {
            for method in class.methods {
                for target in &method.overrides {
                    let entry =
                        self.table
                            .entry(target.name.clone())
                            .or_insert_with(|| PolyEntry {
                                name: target.name.clone(),
                                sname: target.sname.clone(),
                                derived: Vec::new(),
                            });
                    if entry.sname.is_empty() && !target.sname.is_empty() {
                        entry.sname = target.sname.clone();
                    }
                    if !entry.derived.iter().any(|d| d.name == method.name) {
                        entry.derived.push(DerivedMethod {
                            name: method.name.clone(),
                            sname: method.sname.clone(),
                        });
                    }
                }
            }
        }
    }

    /// All transitive overriders of a method, in discovery order.
    ///
    /// The table is expected to be a forest, but a visited set guards against
    /// accidental override cycles in the extracted data.
    pub(crate) fn transitive_overriders(&self, usr: &str) -> Vec<DerivedMethod> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        seen.insert(usr.to_string());
        let mut stack = vec![usr.to_string()];
        let mut overriders = Vec::new();
        while let Some(current) = stack.pop() {
            let Some(entry) = self.table.get(&current) else {
                continue;
            };
            for derived in &entry.derived {
                if seen.insert(derived.name.clone()) {
                    overriders.push(derived.clone());
                    stack.push(derived.name.clone());
                }
            }
        }
        overriders
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &PolyEntry> {
        self.table.values()
    }
}
