//! Property tests for the tagged value encoding.

use kiln_common_core::{Address, Decoded, Symbol, Value};
use proptest::prelude::*;

/// Largest relative error introduced by dropping 4 mantissa bits.
const FLOAT_RELATIVE_ERROR: f64 = 1.0 / (1u64 << 48) as f64;

/// Largest absolute error for subnormals: 15 units of `2^-1074`.
fn subnormal_absolute_error() -> f64 {
    f64::from_bits(15)
}

fn any_immediate() -> impl Strategy<Value = Value> {
    prop_oneof![
        (Value::INT_MIN..=Value::INT_MAX).prop_map(Value::int),
        any::<f64>().prop_map(Value::float),
        any::<bool>().prop_map(Value::bool),
        any::<u32>().prop_map(|s| Value::symbol(Symbol::from_raw(s))),
        Just(Value::NULL),
        Just(Value::ERROR_EXCEPTION),
        Just(Value::ERROR_NOT_FOUND),
        "[a-z]{0,7}".prop_map(|s| Value::small_string(&s).unwrap()),
        proptest::collection::vec(any::<u8>(), 0..=7).prop_map(|b| Value::small_bytes(&b).unwrap()),
    ]
}

proptest! {
    #[test]
    fn int_round_trips_in_range(n in Value::INT_MIN..=Value::INT_MAX) {
        let v = Value::int(n);
        prop_assert!(v.is_int());
        prop_assert_eq!(v.as_int(), n);
    }

    #[test]
    fn int_out_of_range_falls_back_to_float(n in prop_oneof![i64::MIN..Value::INT_MIN, (Value::INT_MAX + 1)..=i64::MAX]) {
        let v = Value::int(n);
        prop_assert!(v.is_float());
        let expected = n as f64;
        prop_assert!((v.as_float() - expected).abs() <= expected.abs() * FLOAT_RELATIVE_ERROR);
    }

    #[test]
    fn float_error_is_bounded(
        f in proptest::num::f64::NORMAL
            | proptest::num::f64::SUBNORMAL
            | proptest::num::f64::ZERO
            | proptest::num::f64::INFINITE
    ) {
        let decoded = Value::float(f).as_float();
        if f.is_infinite() {
            prop_assert_eq!(decoded, f);
        } else if f.is_subnormal() {
            prop_assert!((decoded - f).abs() <= subnormal_absolute_error(), "{:e} decoded as {:e}", f, decoded);
            prop_assert!(decoded.abs() <= f.abs());
        } else {
            prop_assert!((decoded - f).abs() <= f.abs() * FLOAT_RELATIVE_ERROR, "{} decoded as {}", f, decoded);
        }
    }

    #[test]
    fn immediates_are_never_pointers(v in any_immediate()) {
        prop_assert!(!v.is_pointer());
        let is_pointer_variant = matches!(v.decode(), Decoded::Pointer { .. });
        prop_assert!(!is_pointer_variant);
        prop_assert!(v.shape_id().is_some());
    }

    #[test]
    fn pointers_decode_to_their_address(granule in 1u64..(1 << 32), young in any::<bool>()) {
        let address = Address::new(granule * 16);
        let v = Value::pointer(address, young);
        prop_assert!(v.is_pointer());
        prop_assert_eq!(v.decode(), Decoded::Pointer { address, young });
        prop_assert_eq!(v.is_young_pointer(), young);
    }
}

#[test]
fn zero_address_pointer_tag_is_not_a_pointer() {
    let v = Value::from_raw(0b1001);
    assert!(!v.is_pointer());
    assert_eq!(v.decode(), Decoded::Null);
}
