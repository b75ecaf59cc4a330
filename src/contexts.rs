/// Grouping specificity of one axis of a context, most specific first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum Specificity {
    /// This exact function.
    Exact,
    /// Every function sharing the simple name.
    Name,
    /// Every function sharing the enclosing scope.
    Scope,
    /// Every function.
    Any,
}

pub(crate) const AXIS: [Specificity; 4] = [
    Specificity::Exact,
    Specificity::Name,
    Specificity::Scope,
    Specificity::Any,
];

/// One of the 17 abstraction levels call sites are grouped by.
///
/// Level 1 is the per-site baseline; the remaining 16 are the caller-major
/// product of caller and callee specificities, so legacy level 3 is
/// this-caller with this-callee and legacy level 33 is the whole universe.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum Context {
    PerSite,
    Group {
        caller: Specificity,
        callee: Specificity,
    },
}

impl Context {
    /// All 17 contexts in compact-number order.
    pub(crate) fn all() -> Vec<Context> {
        let mut contexts = vec![Context::PerSite];
        for caller in AXIS {
            for callee in AXIS {
                contexts.push(Context::Group { caller, callee });
            }
        }
        contexts
    }

    /// Compact context number, 1..=17.
    pub(crate) fn compact(self) -> u32 {
        match self {
            Context::PerSite => 1,
            Context::Group { caller, callee } => {
                2 + axis_index(caller) * 4 + axis_index(callee)
            }
        }
    }

    /// Legacy odd-numbered encoding, 1, 3, 5, ..., 33.
    #[allow(dead_code)]
    pub(crate) fn legacy(self) -> u32 {
        match self {
            Context::PerSite => 1,
            group => 2 * group.compact() - 1,
        }
    }

    pub(crate) fn from_compact(compact: u32) -> Option<Context> {
        match compact {
            1 => Some(Context::PerSite),
            2..=17 => {
                let index = (compact - 2) as usize;
                Some(Context::Group {
                    caller: AXIS[index / 4],
                    callee: AXIS[index % 4],
                })
            }
            _ => None,
        }
    }
}

fn axis_index(specificity: Specificity) -> u32 {
    AXIS.iter()
        .position(|axis| *axis == specificity)
        .expect("specificity in axis") as u32
}

/// Remap a legacy context number to the compact 1..=17 numbering.
///
/// Legacy 1 stays 1; an even legacy number is first nudged to the next odd
/// level, then every odd level `c` maps to `(c + 1) / 2`.
pub(crate) fn remap_legacy(context: u32) -> u32 {
    if context <= 1 {
        return 1;
    }
    let odd = if context % 2 == 0 { context + 1 } else { context };
    (odd + 1) / 2
}

// `a` groups at least as tightly as `b` on one axis. Name and Scope are
// incomparable: sharing a simple name says nothing about sharing a scope.
fn at_least_as_specific(a: Specificity, b: Specificity) -> bool {
    a == b || a == Specificity::Exact || b == Specificity::Any
}

/// Contexts implied as checked when a fix was verified at `context`.
///
/// A handler reviewed over a coarse group covers every strictly finer group
/// it contains, down to the per-site baseline.
pub(crate) fn checked_contexts(context: Context) -> Vec<Context> {
    let Context::Group { caller, callee } = context else {
        return Vec::new();
    };
    let mut checked = vec![Context::PerSite];
    for finer_caller in AXIS {
        for finer_callee in AXIS {
            let candidate = Context::Group {
                caller: finer_caller,
                callee: finer_callee,
            };
            if candidate != context
                && at_least_as_specific(finer_caller, caller)
                && at_least_as_specific(finer_callee, callee)
            {
                checked.push(candidate);
            }
        }
    }
    checked
}
