//! Property-based test generators.

use proptest::prelude::*;

/// Strategy over sort directions as they appear in the query grammar.
pub fn sort_direction() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("ASC"), Just("DESC")]
}

/// Strategy over sortable `Person` property names.
pub fn person_sort_property() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("name"), Just("age"), Just("score")]
}

/// Strategy over small ages, matching the seeded fixture range.
pub fn small_age() -> impl Strategy<Value = i64> {
    0..100i64
}

/// Strategy over limit values, including zero.
pub fn limit_value() -> impl Strategy<Value = usize> {
    0..20usize
}
