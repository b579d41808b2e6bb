//! Topic matcher property tests
//!
//! Checks the level-wise matcher against a straightforward recursive
//! reference implementation across generated filters and names.

use proptest::prelude::*;

use wrenmq::topic::{topic_matches_filter, validate_topic_filter};

/// Reference matcher: recursion over level slices
fn reference_matches(filter: &[&str], name: &[&str]) -> bool {
    match (filter.split_first(), name.split_first()) {
        (None, None) => true,
        (Some((&"#", _)), _) => true,
        (None, Some(_)) => false,
        (Some(_), None) => false,
        (Some((&f, filter_rest)), Some((&n, name_rest))) => {
            (f == "+" || f == n) && reference_matches(filter_rest, name_rest)
        }
    }
}

fn topic_level() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("a".to_string()),
        Just("b".to_string()),
        Just("aa".to_string()),
        Just("c".to_string()),
        Just("".to_string()),
    ]
}

fn filter_level() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("a".to_string()),
        Just("b".to_string()),
        Just("aa".to_string()),
        Just("+".to_string()),
        Just("".to_string()),
    ]
}

fn topic_name() -> impl Strategy<Value = String> {
    prop::collection::vec(topic_level(), 1..5).prop_map(|levels| levels.join("/"))
}

fn topic_filter() -> impl Strategy<Value = String> {
    (prop::collection::vec(filter_level(), 0..4), any::<bool>()).prop_map(
        |(mut levels, hash)| {
            if hash {
                levels.push("#".to_string());
            } else if levels.is_empty() {
                levels.push("a".to_string());
            }
            levels.join("/")
        },
    )
}

proptest! {
    #[test]
    fn matcher_agrees_with_reference(filter in topic_filter(), name in topic_name()) {
        let filter_levels: Vec<&str> = filter.split('/').collect();
        let name_levels: Vec<&str> = name.split('/').collect();

        prop_assert_eq!(
            topic_matches_filter(&name, &filter),
            reference_matches(&filter_levels, &name_levels),
            "filter={:?} name={:?}", filter, name
        );
    }

    #[test]
    fn matcher_reflexive_on_concrete_names(name in topic_name()) {
        prop_assert!(topic_matches_filter(&name, &name));
    }

    #[test]
    fn generated_filters_validate(filter in topic_filter()) {
        prop_assert!(validate_topic_filter(&filter).is_ok(), "filter={:?}", filter);
    }
}
