//! Convenience helpers for documents whose fields may or may not be sealed.
//!
//! These helpers are fail-soft: [`safe_decrypt`] degrades to a placeholder and
//! [`safe_encrypt`] falls back to plaintext. Paths that must never store
//! plaintext call [`EnvelopeCipher::encrypt_value`] directly instead.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::cipher::{EncryptedValue, EnvelopeCipher};

/// Shown in place of a value that could not be decrypted.
pub const DECRYPTION_PLACEHOLDER: &str = "[encrypted value unavailable]";

/// What [`safe_encrypt`] hands back: sealed when possible, plaintext otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredField {
    Encrypted(EncryptedValue),
    Plain(String),
}

impl StoredField {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, StoredField::Encrypted(_))
    }

    pub fn to_json(&self) -> Value {
        match self {
            StoredField::Encrypted(sealed) => {
                serde_json::to_value(sealed).unwrap_or(Value::Null)
            }
            StoredField::Plain(text) => Value::String(text.clone()),
        }
    }
}

/// Plain strings pass through, envelopes are opened, anything else is
/// stringified. Never fails.
pub fn safe_decrypt(cipher: &EnvelopeCipher, value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => match EncryptedValue::from_json(other) {
            Some(sealed) => open_or_placeholder(cipher, &sealed),
            None => other.to_string(),
        },
    }
}

pub fn safe_decrypt_field(cipher: &EnvelopeCipher, field: &StoredField) -> String {
    match field {
        StoredField::Plain(text) => text.clone(),
        StoredField::Encrypted(sealed) => open_or_placeholder(cipher, sealed),
    }
}

/// Already-sealed values pass through unchanged. On any encryption failure
/// the plaintext is returned as-is.
pub fn safe_encrypt(cipher: &EnvelopeCipher, value: &Value) -> StoredField {
    if let Some(sealed) = EncryptedValue::from_json(value) {
        return StoredField::Encrypted(sealed);
    }
    let plaintext = match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    match cipher.encrypt_value(&plaintext) {
        Ok(sealed) => StoredField::Encrypted(sealed),
        Err(err) => {
            warn!(error = %err, "field encryption failed, keeping plaintext");
            StoredField::Plain(plaintext)
        }
    }
}

/// Linear scan: decrypts `field` on every document and compares
/// case-insensitively. Only suitable for small collections.
pub fn find_by_encrypted_field<'a, I>(
    cipher: &EnvelopeCipher,
    documents: I,
    field: &str,
    query: &str,
) -> Option<&'a Value>
where
    I: IntoIterator<Item = &'a Value>,
{
    let needle = query.to_lowercase();
    documents
        .into_iter()
        .find(|doc| field_matches(cipher, doc, field, &needle))
}

pub fn find_all_by_encrypted_field<'a, I>(
    cipher: &EnvelopeCipher,
    documents: I,
    field: &str,
    query: &str,
) -> Vec<&'a Value>
where
    I: IntoIterator<Item = &'a Value>,
{
    let needle = query.to_lowercase();
    documents
        .into_iter()
        .filter(|doc| field_matches(cipher, doc, field, &needle))
        .collect()
}

fn field_matches(cipher: &EnvelopeCipher, doc: &Value, field: &str, needle: &str) -> bool {
    let Some(raw) = doc.get(field) else {
        return false;
    };
    let plaintext = safe_decrypt(cipher, raw);
    plaintext != DECRYPTION_PLACEHOLDER && plaintext.to_lowercase() == needle
}

fn open_or_placeholder(cipher: &EnvelopeCipher, sealed: &EncryptedValue) -> String {
    cipher.decrypt_value(sealed).unwrap_or_else(|err| {
        warn!(error = %err, "substituting placeholder for undecryptable field");
        DECRYPTION_PLACEHOLDER.to_owned()
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cipher::MasterKey;

    #[test]
    fn plain_strings_pass_through_decrypt() {
        let cipher = EnvelopeCipher::unconfigured();
        assert_eq!(safe_decrypt(&cipher, &json!("hello")), "hello");
        assert_eq!(safe_decrypt(&cipher, &json!(42)), "42");
        assert_eq!(safe_decrypt(&cipher, &Value::Null), "");
    }

    #[test]
    fn corrupt_envelopes_degrade_to_placeholder() {
        let cipher = EnvelopeCipher::new(MasterKey::generate());
        let mut sealed = cipher.encrypt_value("secret").unwrap();
        sealed.auth_tag = EnvelopeCipher::new(MasterKey::generate())
            .encrypt_value("other")
            .unwrap()
            .auth_tag;
        let value = serde_json::to_value(&sealed).unwrap();
        assert_eq!(safe_decrypt(&cipher, &value), DECRYPTION_PLACEHOLDER);
    }

    #[test]
    fn safe_encrypt_is_idempotent_on_sealed_values() {
        let cipher = EnvelopeCipher::new(MasterKey::generate());
        let first = safe_encrypt(&cipher, &json!("jane@example.org"));
        assert!(first.is_encrypted());
        let second = safe_encrypt(&cipher, &first.to_json());
        assert_eq!(first, second);
        assert_eq!(safe_decrypt_field(&cipher, &second), "jane@example.org");
    }

    #[test]
    fn safe_encrypt_fails_open_without_master_key() {
        let cipher = EnvelopeCipher::unconfigured();
        assert_eq!(
            safe_encrypt(&cipher, &json!("visible")),
            StoredField::Plain("visible".into())
        );
    }

    #[test]
    fn stored_field_deserializes_both_shapes() {
        let cipher = EnvelopeCipher::new(MasterKey::generate());
        let sealed = safe_encrypt(&cipher, &json!("x"));
        let parsed: StoredField = serde_json::from_value(sealed.to_json()).unwrap();
        assert!(parsed.is_encrypted());
        let plain: StoredField = serde_json::from_value(json!("y")).unwrap();
        assert_eq!(plain, StoredField::Plain("y".into()));
    }

    #[test]
    fn finds_documents_by_decrypted_value() {
        let cipher = EnvelopeCipher::new(MasterKey::generate());
        let docs = vec![
            json!({ "id": 1, "email": safe_encrypt(&cipher, &json!("a@school.edu")).to_json() }),
            json!({ "id": 2, "email": safe_encrypt(&cipher, &json!("B@school.edu")).to_json() }),
            json!({ "id": 3, "email": "b@school.edu" }),
        ];
        let first = find_by_encrypted_field(&cipher, &docs, "email", "b@SCHOOL.edu").unwrap();
        assert_eq!(first["id"], 2);
        let all = find_all_by_encrypted_field(&cipher, &docs, "email", "b@school.edu");
        assert_eq!(all.len(), 2);
        assert!(find_by_encrypted_field(&cipher, &docs, "email", "c@school.edu").is_none());
    }
}
