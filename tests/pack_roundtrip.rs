mod common;

use ndarray::IxDyn;

use common::*;
use spanfill::data::pack::{pack, pack_with, FieldStack, PackOptions};
use spanfill::SpanError;

#[test]
fn gap_preserving_pack_round_trips_any_masked_field() {
    for seed in 0..25 {
        let field = random_masked_field(seed, &[12, 3, 5], 0.3);
        let packed = match pack_with(&field, None, PackOptions::keep_gaps(1)) {
            Ok(p) => p,
            Err(SpanError::EmptyPack { .. }) => continue,
            Err(e) => panic!("{e}"),
        };
        assert_eq!(packed.mask.iter().filter(|&&m| m).count(), packed.n_channels());
        let back = packed.unpack(packed.data.view(), -1e20).unwrap();
        assert_eq!(back.mask(), field.mask(), "seed {seed}");
        for ((idx, v), m) in field.values().indexed_iter().zip(field.mask().iter()) {
            if !m {
                assert_eq!(back.values()[idx], *v);
            }
        }
    }
}

#[test]
fn strict_pack_keeps_only_complete_series() {
    for seed in 0..10 {
        let field = random_masked_field(seed, &[4, 6], 0.1);
        let Ok(packed) = pack(&field, None) else {
            continue;
        };
        assert!(packed.data.iter().all(|v| v.is_finite()));
        let back = packed.unpack(packed.data.view(), f64::NAN).unwrap();
        for s in 0..6 {
            let complete = (0..4).all(|t| !field.is_missing(&[t, s]));
            assert_eq!(packed.mask[s], complete);
            for t in 0..4 {
                assert_eq!(back.is_missing(&[t, s]), !complete);
                if complete {
                    assert_eq!(back.values()[IxDyn(&[t, s])], field.values()[IxDyn(&[t, s])]);
                }
            }
        }
    }
}

#[test]
fn stacked_fields_unstack_to_their_own_shapes() {
    let a = random_masked_field(1, &[10, 2, 2], 0.1);
    let b = random_masked_field(2, &[10, 7], 0.1);
    let stack = FieldStack::new(&[a.clone(), b.clone()], PackOptions::keep_gaps(1)).unwrap();
    let fields = stack.unstack(stack.matrix().view(), f64::NAN).unwrap();
    assert_eq!(fields[0].shape(), a.shape());
    assert_eq!(fields[1].shape(), b.shape());
    assert_eq!(fields[0].mask(), a.mask());
    assert_eq!(fields[1].name, b.name);
}
