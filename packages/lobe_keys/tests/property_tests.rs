use proptest::prelude::*;

use lobe_keys::api_key::{API_KEY_BODY_LEN, ApiKeyValue};
use lobe_keys::{DigestEncryptor, generate_api_key, validate_api_key_format};

// --- Format validation ---

proptest! {
    #[test]
    fn well_formed_bodies_accepted(body in "[0-9a-z]{16}") {
        let key = format!("lb-{body}");
        prop_assert!(validate_api_key_format(&key));
        prop_assert!(ApiKeyValue::parse(&key).is_ok());
    }

    #[test]
    fn wrong_length_rejected(body in "[0-9a-z]{0,40}") {
        prop_assume!(body.len() != API_KEY_BODY_LEN);
        let key = format!("lb-{body}");
        prop_assert!(!validate_api_key_format(&key));
    }

    #[test]
    fn arbitrary_strings_without_prefix_rejected(s in "\\PC*") {
        prop_assume!(!s.starts_with("lb-"));
        prop_assert!(!validate_api_key_format(&s));
    }

    #[test]
    fn uppercase_body_rejected(body in "[A-Z]{16}") {
        let key = format!("lb-{body}");
        prop_assert!(!validate_api_key_format(&key));
    }
}

// --- Generation ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn generated_keys_always_validate(_seed in any::<u8>()) {
        let key = generate_api_key();
        prop_assert!(validate_api_key_format(&key));
        prop_assert!(key[3..].bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }
}

// --- Digest ---

proptest! {
    #[test]
    fn digest_distinguishes_keys(a in "[0-9a-z]{16}", b in "[0-9a-z]{16}") {
        prop_assume!(a != b);
        let vault = DigestEncryptor::new("pepper");
        prop_assert_ne!(vault.digest(&format!("lb-{a}")), vault.digest(&format!("lb-{b}")));
    }
}
