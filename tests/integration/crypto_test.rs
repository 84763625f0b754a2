//! Field-encryption laws.

use base64::Engine as _;
use neobase::crypto::FieldCipher;

fn cipher() -> FieldCipher {
    let key = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
    FieldCipher::from_base64_key(&key).unwrap()
}

#[test]
fn decrypt_of_encrypt_is_identity() {
    let cipher = cipher();
    for value in ["hello", "42", "{\"k\": \"v\"}", "naïve café"] {
        let stored = cipher.encrypt(value).unwrap();
        assert_eq!(cipher.decrypt(&stored).unwrap(), value);
    }
}

#[test]
fn encrypt_never_repeats_bytes() {
    let cipher = cipher();
    let a = cipher.encrypt("same plaintext").unwrap();
    let b = cipher.encrypt("same plaintext").unwrap();
    assert_ne!(a, b, "fresh nonce per encryption");
}

#[test]
fn stored_values_carry_the_marker() {
    let cipher = cipher();
    let stored = cipher.encrypt("cell value").unwrap();
    assert!(FieldCipher::is_encrypted(&stored));
    assert!(stored.starts_with("ENC:"));

    // Empty stays empty, unmarked.
    assert_eq!(cipher.encrypt("").unwrap(), "");
}

#[test]
fn legacy_plaintext_reads_transparently() {
    let cipher = cipher();
    assert_eq!(cipher.decrypt("plain legacy cell").unwrap(), "plain legacy cell");
}
