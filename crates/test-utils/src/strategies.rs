//! Proptest strategies for discovery values.
//!
//! Reusable generators for property-based testing across crates. Values are
//! plain strings and numbers so the generators stay independent of the SDK's
//! types; tests build URIs and instances from them.
//!
//! # Usage
//!
//! ```no_run
//! use lodestar_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(uris in strategies::arb_instance_uris(1..8)) {
//!         // test invariant with randomly generated registrations
//!     }
//! }
//! ```

use std::ops::Range;

use proptest::prelude::*;

/// Generates a service identifier matching `[a-z][a-z0-9-]{0,15}`.
pub fn arb_service_id() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,15}"
}

/// Generates a zone label from a small fixed set, so collisions are common.
pub fn arb_zone() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "default".to_string(),
        "us-east-1a".to_string(),
        "us-east-1b".to_string(),
        "eu-west-1a".to_string(),
    ])
}

/// Generates a lowercase DNS hostname of one to three labels.
pub fn arb_host() -> impl Strategy<Value = String> {
    proptest::collection::vec("[a-z][a-z0-9]{0,7}", 1..=3).prop_map(|labels| labels.join("."))
}

/// Generates a non-zero port.
pub fn arb_port() -> impl Strategy<Value = u16> {
    1u16..=u16::MAX
}

/// Generates an instance URI of the form `dns://host:port`.
pub fn arb_instance_uri() -> impl Strategy<Value = String> {
    (arb_host(), arb_port()).prop_map(|(host, port)| format!("dns://{host}:{port}"))
}

/// Generates a list of distinct instance URIs with a length in `len`.
pub fn arb_instance_uris(len: Range<usize>) -> impl Strategy<Value = Vec<String>> {
    proptest::collection::hash_set(arb_instance_uri(), len).prop_map(|set| {
        let mut uris: Vec<String> = set.into_iter().collect();
        uris.sort();
        uris
    })
}

/// Generates `(uri, zone)` registrations with a length in `len`.
pub fn arb_registrations(len: Range<usize>) -> impl Strategy<Value = Vec<(String, String)>> {
    proptest::collection::vec((arb_instance_uri(), arb_zone()), len)
}

/// Generates an IPv4 literal in the 10.0.0.0/8 range.
pub fn arb_private_ipv4() -> impl Strategy<Value = String> {
    (any::<u8>(), any::<u8>(), 1u8..=254).prop_map(|(b, c, d)| format!("10.{b}.{c}.{d}"))
}
