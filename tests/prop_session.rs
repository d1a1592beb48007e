use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;

use sessiondb::{Key, MemoryStore, Session, Value};

#[derive(Debug, Clone)]
enum Step {
    Write { key: u8, value: u8 },
    Erase { key: u8 },
    Commit,
}

const KEY_SPACE: u8 = 8;

fn key_bytes(key: u8) -> Vec<u8> {
    vec![b'a' + (key % KEY_SPACE)]
}

fn value_bytes(value: u8) -> Vec<u8> {
    vec![b'0' + (value % 10)]
}

/// Composed-view lookup against the reference model: the delta wins, a
/// tombstone hides the root, otherwise the root answers.
fn expected_value(
    root: &BTreeMap<Vec<u8>, Vec<u8>>,
    delta: &BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    key: &[u8],
) -> Option<Vec<u8>> {
    match delta.get(key) {
        Some(entry) => entry.clone(),
        None => root.get(key).cloned(),
    }
}

fn collect_forward(session: &Session) -> anyhow::Result<Vec<(Key, Value)>> {
    let mut out = Vec::new();
    let mut cursor = session.begin();
    let mut last: Option<Key> = None;
    while let Some(entry) = cursor.entry() {
        let (key, value) = entry?;
        if let Some(previous) = &last {
            if key <= *previous {
                break;
            }
        }
        if let Some(value) = value {
            out.push((key.clone(), value));
        }
        last = Some(key);
        cursor.move_next();
    }
    Ok(out)
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn prop_session_matches_reference(steps in prop::collection::vec(step_strategy(), 1..60)) {
        let store = MemoryStore::new();
        let session = Session::with_parent(&store);

        let mut root: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut delta: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();

        for step in &steps {
            match step {
                Step::Write { key, value } => {
                    session
                        .write(Bytes::from(key_bytes(*key)), Bytes::from(value_bytes(*value)))
                        .unwrap();
                    delta.insert(key_bytes(*key), Some(value_bytes(*value)));
                }
                Step::Erase { key } => {
                    session.erase(&Bytes::from(key_bytes(*key))).unwrap();
                    delta.insert(key_bytes(*key), None);
                }
                Step::Commit => {
                    session.commit().unwrap();
                    for (key, value) in std::mem::take(&mut delta) {
                        match value {
                            Some(value) => {
                                root.insert(key, value);
                            }
                            None => {
                                root.remove(&key);
                            }
                        }
                    }
                }
            }

            for k in 0..KEY_SPACE {
                let raw = key_bytes(k);
                let key = Bytes::from(raw.clone());
                let expected = expected_value(&root, &delta, &raw);

                let got = session.read(&key).unwrap();
                prop_assert_eq!(got.map(|v| v.to_vec()), expected.clone());
                prop_assert_eq!(session.contains(&key).unwrap(), expected.is_some());
                prop_assert_eq!(
                    session.is_deleted(&key),
                    matches!(delta.get(&raw), Some(None))
                );
            }

            // The delta sets stay disjoint and sized like the model.
            let metrics = session.metrics();
            prop_assert_eq!(
                metrics.updated_keys,
                delta.values().filter(|v| v.is_some()).count()
            );
            prop_assert_eq!(
                metrics.deleted_keys,
                delta.values().filter(|v| v.is_none()).count()
            );
        }

        // Ordered traversal yields exactly the visible pairs, in key order.
        let expected_pairs: Vec<(Key, Value)> = (0..KEY_SPACE)
            .filter_map(|k| {
                let raw = key_bytes(k);
                expected_value(&root, &delta, &raw)
                    .map(|v| (Bytes::from(raw), Bytes::from(v)))
            })
            .collect();
        prop_assert_eq!(collect_forward(&session).unwrap(), expected_pairs.clone());

        // Committing flushes the composed view into the root store.
        session.commit().unwrap();
        prop_assert_eq!(store.to_pairs(), expected_pairs);
    }

    #[test]
    fn prop_advance_then_retreat_returns(
        present in prop::collection::btree_set(0u8..KEY_SPACE, 2..(KEY_SPACE as usize)),
        pick in any::<prop::sample::Index>(),
    ) {
        let keys: Vec<u8> = present.iter().copied().collect();
        // Exclude the last key so neither step crosses the wraparound.
        let pick = pick.index(keys.len() - 1);

        let session = Session::new();
        for k in &keys {
            session
                .write(Bytes::from(key_bytes(*k)), Bytes::from(value_bytes(*k)))
                .unwrap();
        }

        let key = Bytes::from(key_bytes(keys[pick]));
        let mut cursor = session.find(&key);
        prop_assert_eq!(cursor.key(), Some(&key));

        cursor.move_next();
        cursor.move_previous();
        prop_assert_eq!(cursor.key(), Some(&key));
    }
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0u8..KEY_SPACE, any::<u8>()).prop_map(|(key, value)| Step::Write { key, value }),
        2 => (0u8..KEY_SPACE).prop_map(|key| Step::Erase { key }),
        1 => Just(Step::Commit),
    ]
}
