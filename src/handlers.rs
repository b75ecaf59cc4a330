use std::collections::BTreeSet;

use crate::model::{Ex, WILDCARD_USR};

/// True when one handler in the catch set matches the thrown type.
///
/// A handler matches on the wildcard `...`, on exact USR identity, or when its
/// USR appears among the thrown type's declared base classes.
pub(crate) fn catches(catch_set: &BTreeSet<Ex>, thrown: &Ex) -> bool {
    catch_set
        .iter()
        .any(|handler| matches_handler(handler, thrown))
}

fn matches_handler(handler: &Ex, thrown: &Ex) -> bool {
    handler.usr == WILDCARD_USR || handler.usr == thrown.usr || thrown.parents.contains(&handler.usr)
}

/// Subset of `throw_set` that escapes past the handlers in `catch_set`.
///
/// Returns a fresh set; neither input is mutated.
pub(crate) fn filter(throw_set: &BTreeSet<Ex>, catch_set: &BTreeSet<Ex>) -> BTreeSet<Ex> {
    throw_set
        .iter()
        .filter(|thrown| !catches(catch_set, thrown))
        .cloned()
        .collect()
}

/// Number of thrown types matched by the catch set.
pub(crate) fn caught_count(throw_set: &BTreeSet<Ex>, catch_set: &BTreeSet<Ex>) -> usize {
    throw_set
        .iter()
        .filter(|thrown| catches(catch_set, thrown))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn set(items: Vec<Ex>) -> BTreeSet<Ex> {
        items.into_iter().collect()
    }

    #[test]
    fn wildcard_catches_everything() {
        let handlers = set(vec![ex(WILDCARD_USR)]);

        assert!(catches(&handlers, &ex("c:@S@E")));
        assert!(filter(&set(vec![ex("c:@S@E"), ex("c:@S@F")]), &handlers).is_empty());
    }

    #[test]
    fn identity_match_removes_only_that_type() {
        let handlers = set(vec![ex("c:@S@E")]);
        let escaped = filter(&set(vec![ex("c:@S@E"), ex("c:@S@F")]), &handlers);

        assert_eq!(escaped.len(), 1);
        assert_eq!(escaped.iter().next().expect("survivor").usr, "c:@S@F");
    }

    #[test]
    fn parent_chain_matches_declared_bases() {
        let thrown = ex_with_parents("c:@S@X", &["c:@S@B", "c:@S@A"]);

        assert!(catches(&set(vec![ex("c:@S@A")]), &thrown));
        assert!(catches(&set(vec![ex("c:@S@B")]), &thrown));
        assert!(!catches(&set(vec![ex("c:@S@C")]), &thrown));
    }

    #[test]
    fn filter_is_monotone_in_throws_and_antitone_in_catches() {
        let small_throws = set(vec![ex("c:@S@E")]);
        let big_throws = set(vec![ex("c:@S@E"), ex("c:@S@F")]);
        let small_catches = set(vec![ex("c:@S@E")]);
        let big_catches = set(vec![ex("c:@S@E"), ex("c:@S@F")]);

        assert!(
            filter(&small_throws, &small_catches).is_subset(&filter(&big_throws, &small_catches))
        );
        assert!(filter(&big_throws, &big_catches).is_subset(&filter(&big_throws, &small_catches)));
    }

    #[test]
    fn filter_does_not_mutate_inputs() {
        let throws = set(vec![ex("c:@S@E"), ex("c:@S@F")]);
        let handlers = set(vec![ex("c:@S@E")]);

        let _ = filter(&throws, &handlers);

        assert_eq!(throws.len(), 2);
        assert_eq!(handlers.len(), 1);
    }

    #[test]
    fn caught_count_counts_matched_throws() {
        let throws = set(vec![ex("c:@S@E"), ex("c:@S@F")]);

        assert_eq!(caught_count(&throws, &set(vec![ex("c:@S@E")])), 1);
        assert_eq!(caught_count(&throws, &set(vec![ex(WILDCARD_USR)])), 2);
        assert_eq!(caught_count(&throws, &BTreeSet::new()), 0);
    }
}
