//! Envelope Encoding Property Tests
//!
//! Decoding an encoded envelope must reproduce the listener and the exact
//! parameter sequence for every supported parameter type.

use codec::{Document, Invoke, InvokeParameter, ParameterValue};
use proptest::prelude::*;

fn document_strategy() -> impl Strategy<Value = Document> {
    let leaf = ("[a-z]{1,8}", proptest::option::of("[ -~]{0,16}")).prop_map(|(tag, value)| {
        let mut doc = Document::new(tag);
        if let Some(value) = value {
            doc.set_value(value);
        }
        doc
    });
    leaf.prop_recursive(3, 16, 4, |inner| {
        ("[a-z]{1,8}", proptest::collection::vec(inner, 0..4), "[a-z]{0,6}").prop_map(
            |(tag, children, attr)| {
                let mut doc = Document::new(tag).with_attribute("attr", attr);
                for child in children {
                    doc.push_child(child);
                }
                doc
            },
        )
    })
}

fn parameter_strategy() -> impl Strategy<Value = InvokeParameter> {
    let value = prop_oneof![
        any::<bool>().prop_map(ParameterValue::Boolean),
        // NaN never compares equal, so keep to finite numbers
        (-1.0e12f64..1.0e12).prop_map(ParameterValue::Number),
        "[ -~]{0,24}".prop_map(ParameterValue::String),
        document_strategy().prop_map(ParameterValue::Document),
    ];
    (proptest::option::of("_?[a-z]{1,6}"), value).prop_map(|(name, value)| match name {
        Some(name) => InvokeParameter::named(name, value),
        None => InvokeParameter::new(value),
    })
}

proptest! {
    /// Property: decode(encode(invoke)) reproduces listener and parameters
    #[test]
    fn envelope_encoding_is_lossless(
        listener in "[A-Za-z_][A-Za-z0-9_]{0,15}",
        parameters in proptest::collection::vec(parameter_strategy(), 0..6),
    ) {
        let mut invoke = Invoke::new(listener.clone());
        for parameter in parameters.clone() {
            invoke.push(parameter);
        }

        let bytes = invoke.to_bytes().unwrap();
        let restored = Invoke::from_bytes(&bytes).unwrap();

        prop_assert_eq!(restored.listener(), listener.as_str());
        prop_assert_eq!(restored.parameters(), parameters.as_slice());
    }

    /// Property: arity counts only unreserved parameters
    #[test]
    fn arity_ignores_reserved(parameters in proptest::collection::vec(parameter_strategy(), 0..8)) {
        let expected = parameters.iter().filter(|p| !p.is_reserved()).count();
        let mut invoke = Invoke::new("listener");
        for parameter in parameters {
            invoke.push(parameter);
        }
        prop_assert_eq!(invoke.arity(), expected);
    }
}
