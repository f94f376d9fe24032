// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests for the change log: round trips, platform fallback,
//! collapse, and blob sweeping.

use proptest::prelude::*;
use rp_platform::PlatformSpec;
use rp_source::{BlobStore, ChangeValue, ResourceSource};
use std::collections::HashSet;
use uuid::Uuid;

const K: u64 = 0xabc0;

fn platform(custom: Option<u8>, quality: Option<u8>, base: Option<u8>) -> u64 {
    PlatformSpec {
        base,
        quality,
        custom,
        ..PlatformSpec::ANY
    }
    .pack()
    .expect("valid fields")
}

// ── Scenario: set/get with platform fallback ────────────────────────

#[test]
fn platform_fallback_prefers_most_specific() {
    let p_custom = platform(Some(1), None, None);
    let p_custom_plus_quality = platform(Some(1), Some(2), None);
    let p_other = platform(Some(3), None, None);

    let mut source = ResourceSource::new();
    source.set(100, K, 0, b"a");
    source.set(101, K, p_custom, b"b");

    let get = |p| match source.get(K, p).unwrap().value {
        ChangeValue::Value(v) => v.to_vec(),
        other => panic!("unexpected payload {other:?}"),
    };
    assert_eq!(get(p_custom_plus_quality), b"b");
    assert_eq!(get(p_other), b"a");
    assert_eq!(get(0), b"a");
}

// ── Quantified properties ───────────────────────────────────────────

fn arb_value() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..200)
}

fn arb_platform() -> impl Strategy<Value = u64> {
    prop_oneof![
        Just(0u64),
        (0u8..=4).prop_map(|b| platform(None, None, Some(b))),
        (0u8..=4).prop_map(|c| platform(Some(c), None, None)),
    ]
}

proptest! {
    // P1: the last set at a (key, platform) wins.
    #[test]
    fn last_set_wins(values in proptest::collection::vec(arb_value(), 1..20), p in arb_platform()) {
        let mut source = ResourceSource::new();
        for (i, v) in values.iter().enumerate() {
            source.set(i as i64 + 1, K, p, v);
        }
        let hit = source.get(K, p).expect("set value present");
        prop_assert_eq!(hit.value, ChangeValue::Value(values.last().unwrap().as_slice()));
    }

    // P2: a later unset hides every earlier set.
    #[test]
    fn unset_overrides(v in arb_value(), p in arb_platform()) {
        let mut source = ResourceSource::new();
        source.set(1, K, p, &v);
        source.unset(2, K, p);
        prop_assert!(source.get(K, p).is_none());
    }

    // P4: collapse is idempotent and keeps one winner per live (key, platform).
    #[test]
    fn collapse_idempotent(
        ops in proptest::collection::vec(
            (0u64..6, arb_platform(), arb_value(), any::<bool>()),
            1..60,
        )
    ) {
        let mut source = ResourceSource::new();
        let mut last: std::collections::HashMap<(u64, u64), bool> = Default::default();
        for (i, (key, p, value, is_unset)) in ops.iter().enumerate() {
            let key = 0x9000 + key;
            if *is_unset {
                source.unset(i as i64 + 1, key, *p);
            } else {
                source.set(i as i64 + 1, key, *p, value);
            }
            last.insert((key, *p), *is_unset);
        }
        let live = last.values().filter(|unset| !**unset).count();

        source.collapse_history();
        prop_assert_eq!(source.change_count(), live);
        prop_assert!(source.iter().all(|c| !c.value.is_unset()));

        let snapshot: Vec<_> = source
            .iter()
            .map(|c| (c.timestamp, c.key, c.platform))
            .collect();
        source.collapse_history();
        let again: Vec<_> = source
            .iter()
            .map(|c| (c.timestamp, c.key, c.platform))
            .collect();
        prop_assert_eq!(snapshot, again);
    }

    // P5: write/read symmetry in both formats.
    #[test]
    fn write_read_symmetry(
        ops in proptest::collection::vec(
            (0u64..6, arb_platform(), arb_value(), 0u8..3),
            0..40,
        ),
        binary in any::<bool>(),
    ) {
        let mut source = ResourceSource::new();
        for (i, (key, p, value, kind)) in ops.iter().enumerate() {
            let key = 0x9000 + key;
            let ts = i as i64 + 1;
            match *kind {
                0 => source.set(ts, key, *p, value),
                1 => source.set_blob(ts, key, *p, rp_core::hash64(value), value.len() as u64),
                _ => source.unset(ts, key, *p),
            }
        }

        let mut buf = Vec::new();
        source.write_to(&mut buf, binary).unwrap();
        let loaded = ResourceSource::read_from(&mut buf.as_slice()).unwrap();

        let logical = |s: &ResourceSource| -> Vec<(i64, u64, u64, String)> {
            s.iter()
                .map(|c| {
                    let payload = match c.value {
                        ChangeValue::Value(v) => format!("={v:?}"),
                        ChangeValue::Blob { checksum, size } => format!("#{checksum}/{size}"),
                        ChangeValue::Unset => "-".into(),
                    };
                    (c.timestamp, c.key, c.platform, payload)
                })
                .collect()
        };
        prop_assert_eq!(logical(&source), logical(&loaded));
        prop_assert_eq!(source.source_hash(), loaded.source_hash());
    }
}

// P3: a more specific query with no closer specialization sees the same
// value as the reference platform.
#[test]
fn reduction_reaches_less_specific_platforms() {
    let reference = platform(None, None, Some(1));
    let query = platform(Some(7), Some(3), Some(1));
    assert!(rp_platform::equal_or_more_specific(query, reference));

    let mut source = ResourceSource::new();
    source.set(1, K, reference, b"ref");
    let at_ref = source.get(K, reference).unwrap();
    let at_query = source.get(K, query).unwrap();
    assert_eq!(at_ref.value, at_query.value);
}

// P9: after a sweep, every surviving sidecar is referenced by the source.
#[test]
fn blob_sweep_leaves_only_referenced_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobStore::new(dir.path());
    let uuid = Uuid::from_u128(0x5eed);

    let mut source = ResourceSource::new();
    let mut referenced = HashSet::new();
    for i in 0..4u64 {
        let payload = vec![i as u8; 8];
        let checksum = rp_core::hash64(&payload);
        source.set_blob(i as i64 + 1, K, 0, checksum, payload.len() as u64);
        store.write(uuid, K, 0, checksum, &payload).unwrap();
        referenced.insert(checksum);
    }
    // Orphans from an edit that never landed in the log.
    store.write(uuid, K, 0, 0xdead, b"orphan").unwrap();
    store.write(uuid, K + 1, 3, 0xbeef, b"orphan").unwrap();

    store.clear_history(uuid, &source).unwrap();

    for name in store.enumerate(uuid).unwrap() {
        let sidecar = rp_source::SidecarName::parse(&name).unwrap();
        assert!(referenced.contains(&sidecar.checksum));
    }
    assert_eq!(store.enumerate(uuid).unwrap().len(), 4);
}
