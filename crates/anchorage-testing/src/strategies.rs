//! Proptest strategies and configuration shared by property tests.

use anchorage_core::Digest;
use proptest::{collection::vec, prelude::*, test_runner::Config};

/// Case count honouring `PROPTEST_CASES`, higher under CI.
pub fn proptest_config() -> Config {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(if std::env::var("CI").is_ok() { 256 } else { 32 });

    Config { cases, ..Config::default() }
}

/// Arbitrary digest.
pub fn digest() -> impl Strategy<Value = Digest> {
    any::<[u8; 32]>().prop_map(Digest::new)
}

/// Between `min` and `max` distinct digests, in arbitrary order.
pub fn distinct_digests(min: usize, max: usize) -> impl Strategy<Value = Vec<Digest>> {
    vec(digest(), min..=max).prop_map(|mut digests| {
        digests.sort_unstable();
        digests.dedup();
        digests
    })
    .prop_filter("need at least one digest", |digests| !digests.is_empty())
    .prop_shuffle()
}
