use evalguard_crypto::{
    safe_decrypt, CipherError, EncryptedValue, EnvelopeCipher, MasterKey, DECRYPTION_PLACEHOLDER,
};
use pretty_assertions::assert_eq;
use rand::{distributions::Alphanumeric, Rng};

#[test]
fn random_plaintexts_round_trip_through_json_storage() {
    let cipher = EnvelopeCipher::new(MasterKey::generate());
    let mut rng = rand::thread_rng();
    for len in [1usize, 7, 64, 1_000, 65_536] {
        let plaintext: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect();
        let sealed = cipher.encrypt_value(&plaintext).unwrap();
        let stored = serde_json::to_string(&sealed).unwrap();
        let loaded: EncryptedValue = serde_json::from_str(&stored).unwrap();
        assert_eq!(cipher.decrypt_value(&loaded).unwrap(), plaintext);
    }
}

#[test]
fn persisted_shape_uses_camel_case_fields() {
    let cipher = EnvelopeCipher::new(MasterKey::generate());
    let json = serde_json::to_value(cipher.encrypt_value("hi").unwrap()).unwrap();
    for key in [
        "ciphertext",
        "iv",
        "authTag",
        "wrappedDataKey",
        "dataKeyIv",
        "formatVersion",
    ] {
        assert!(json.get(key).is_some(), "missing {key}");
    }
}

#[test]
fn rotation_keeps_old_values_readable_only_under_new_key() {
    let old = EnvelopeCipher::new(MasterKey::generate());
    let new = EnvelopeCipher::new(MasterKey::generate());
    let sealed: Vec<_> = ["one", "two", "three"]
        .iter()
        .map(|text| old.encrypt_value(text).unwrap())
        .collect();

    let rotated: Vec<_> = sealed
        .iter()
        .map(|value| old.rewrap(value, &new).unwrap())
        .collect();

    let opened: Vec<_> = rotated
        .iter()
        .map(|value| new.decrypt_value(value).unwrap())
        .collect();
    assert_eq!(opened, vec!["one", "two", "three"]);
    assert_eq!(old.decrypt_value(&rotated[0]), Err(CipherError::Decryption));

    let json = serde_json::to_value(&rotated[1]).unwrap();
    assert_eq!(safe_decrypt(&old, &json), DECRYPTION_PLACEHOLDER);
    assert_eq!(safe_decrypt(&new, &json), "two");
}
