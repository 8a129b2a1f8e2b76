//! Property-based test generators using proptest.

use pecal_sync::{Mutation, MutationKind};
use proptest::prelude::*;
use serde_json::json;

/// Strategy for mutation kinds.
pub fn mutation_kind_strategy() -> impl Strategy<Value = MutationKind> {
    prop_oneof![Just(MutationKind::CreateTask), Just(MutationKind::CreateMemo)]
}

/// Strategy for titles the fake backend accepts.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9 ]{0,23}").expect("Invalid regex")
}

/// Strategy for a mutation with a unique-enough title.
pub fn mutation_strategy() -> impl Strategy<Value = Mutation> {
    (mutation_kind_strategy(), 1i64..5, title_strategy())
        .prop_map(|(kind, workspace_id, title)| {
            Mutation::new(kind, workspace_id, json!({ "title": title }))
        })
}

/// Strategy for a batch of mutations with a failure mask of the same
/// length.
pub fn mutation_batch_strategy(
    max: usize,
) -> impl Strategy<Value = Vec<(Mutation, bool)>> {
    prop::collection::vec((mutation_strategy(), any::<bool>()), 0..=max)
}
