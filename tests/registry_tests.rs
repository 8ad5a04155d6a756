//! Tests for the reference-counted command registry.

use kamstrup_rs::coordinator::CommandRegistry;
use kamstrup_rs::{RegisterKey, RegistryError};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone)]
enum Op {
    Attach(u16),
    Detach(u16),
}

fn arb_op() -> impl Strategy<Value = Op> {
    // A small key space so attach and detach hit the same keys often
    prop_oneof![
        (0u16..6).prop_map(Op::Attach),
        (0u16..6).prop_map(Op::Detach),
    ]
}

proptest! {
    /// The active set is exactly the keys with more attaches than detaches.
    #[test]
    fn prop_snapshot_matches_net_attaches(ops in prop::collection::vec(arb_op(), 0..64)) {
        let registry = CommandRegistry::new();
        let mut model: BTreeMap<u16, usize> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Attach(id) => {
                    registry.attach(RegisterKey(id));
                    *model.entry(id).or_default() += 1;
                }
                Op::Detach(id) => {
                    let result = registry.detach(RegisterKey(id));
                    match model.get_mut(&id) {
                        Some(count) => {
                            prop_assert!(result.is_ok());
                            *count -= 1;
                            if *count == 0 {
                                model.remove(&id);
                            }
                        }
                        None => {
                            prop_assert_eq!(result, Err(RegistryError::NotAttached(RegisterKey(id))));
                        }
                    }
                }
            }

            let expected: BTreeSet<RegisterKey> = model.keys().copied().map(RegisterKey).collect();
            prop_assert_eq!(registry.snapshot(), expected);
            for (&id, &count) in &model {
                prop_assert_eq!(registry.count(RegisterKey(id)), count);
            }
        }
    }
}

/// Tests that two consumers sharing a register keep it active until both
/// have detached.
#[test]
fn test_shared_register_survives_one_detach() {
    let registry = CommandRegistry::new();
    let energy = RegisterKey(60);

    registry.attach(energy);
    registry.attach(energy);
    registry.detach(energy).unwrap();
    assert!(registry.snapshot().contains(&energy));

    registry.detach(energy).unwrap();
    assert!(!registry.snapshot().contains(&energy));
    assert!(registry.detach(energy).is_err());
}

/// Tests balanced attach/detach from many threads.
#[test]
fn test_concurrent_attach_detach() {
    let registry = Arc::new(CommandRegistry::new());
    registry.attach(RegisterKey(1));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for i in 0..200u16 {
                    let key = RegisterKey(i % 4 + t % 2);
                    registry.attach(key);
                    let _ = registry.snapshot();
                    registry.detach(key).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(registry.snapshot(), BTreeSet::from([RegisterKey(1)]));
    assert_eq!(registry.count(RegisterKey(1)), 1);
}
