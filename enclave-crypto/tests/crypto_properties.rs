//! Property-based tests for the crypto module.

use enclave_crypto::{
    decrypt_json, encrypt_json, generate_random_key, signing, HashAlgorithm, Integrity,
};
use proptest::prelude::*;
use serde_json::Value;

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

fn json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 _\\-]{0,24}".prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..8)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    #[test]
    fn json_encryption_roundtrips(value in json_strategy()) {
        let key = generate_random_key();
        let encrypted = encrypt_json(&key, &value).unwrap();
        prop_assert_eq!(decrypt_json(&key, &encrypted).unwrap(), value);
    }

    #[test]
    fn signatures_verify_only_for_the_signed_bytes(
        token in "[a-z0-9]{1,32}",
        message in prop::collection::vec(any::<u8>(), 0..512),
        flip in any::<prop::sample::Index>(),
    ) {
        let sig = signing::sign(&token, &message);
        prop_assert!(signing::verify(&token, &message, &sig));

        if !message.is_empty() {
            let mut tampered = message.clone();
            let i = flip.index(tampered.len());
            tampered[i] ^= 0x01;
            prop_assert!(!signing::verify(&token, &tampered, &sig));
        }
    }

    #[test]
    fn computed_integrity_always_verifies(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        for alg in [HashAlgorithm::Sha256, HashAlgorithm::Sha384, HashAlgorithm::Sha512] {
            let integrity = Integrity::compute(alg, &data);
            let reparsed = Integrity::parse(&integrity.to_string()).unwrap();
            prop_assert!(reparsed.verify(&data).is_ok());
        }
    }
}
