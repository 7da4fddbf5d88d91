//! Lookups on encrypted fields.
//!
//! Ciphertext cannot be indexed, so these fetch every document matching
//! `extra`, decrypt `field` and compare case-insensitively. Linear in the
//! collection size; reserved for small reference collections.

use evalguard_crypto::EnvelopeCipher;
use serde_json::Value;
use tracing::debug;

use crate::store::{DocumentStore, Filter, StoreError, StoreResult, EVALUATIONS};

pub async fn find_by_encrypted_field(
    store: &dyn DocumentStore,
    cipher: &EnvelopeCipher,
    collection: &str,
    field: &str,
    query: &str,
    extra: &Filter,
) -> StoreResult<Option<Value>> {
    let documents = scan(store, collection, extra).await?;
    Ok(evalguard_crypto::find_by_encrypted_field(cipher, &documents, field, query).cloned())
}

pub async fn find_all_by_encrypted_field(
    store: &dyn DocumentStore,
    cipher: &EnvelopeCipher,
    collection: &str,
    field: &str,
    query: &str,
    extra: &Filter,
) -> StoreResult<Vec<Value>> {
    let documents = scan(store, collection, extra).await?;
    Ok(evalguard_crypto::find_all_by_encrypted_field(cipher, &documents, field, query)
        .into_iter()
        .cloned()
        .collect())
}

async fn scan(store: &dyn DocumentStore, collection: &str, extra: &Filter) -> StoreResult<Vec<Value>> {
    if collection == EVALUATIONS {
        return Err(StoreError::ForbiddenScan {
            collection: collection.to_owned(),
        });
    }
    let documents = store.find(collection, extra).await?;
    debug!(collection, scanned = documents.len(), "decrypting scan for lookup");
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use evalguard_crypto::MasterKey;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::store::{MemoryStore, ACCOUNTS};

    #[tokio::test]
    async fn finds_accounts_by_encrypted_email() {
        let cipher = EnvelopeCipher::new(MasterKey::generate());
        let store = MemoryStore::new();
        for (id, email, role) in [
            (1, "Dean@School.edu", "admin"),
            (2, "dean@school.edu", "staff"),
            (3, "other@school.edu", "admin"),
        ] {
            let sealed = serde_json::to_value(cipher.encrypt_value(email).unwrap()).unwrap();
            store
                .insert_one(ACCOUNTS, json!({ "id": id, "email": sealed, "role": role }))
                .await
                .unwrap();
        }

        let admin = find_by_encrypted_field(
            &store,
            &cipher,
            ACCOUNTS,
            "email",
            "DEAN@school.edu",
            &Filter::new().eq("role", "admin"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(admin["id"], 1);

        let all = find_all_by_encrypted_field(
            &store,
            &cipher,
            ACCOUNTS,
            "email",
            "dean@school.edu",
            &Filter::new(),
        )
        .await
        .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn refuses_to_scan_evaluations() {
        let cipher = EnvelopeCipher::unconfigured();
        let store = MemoryStore::new();
        let result =
            find_by_encrypted_field(&store, &cipher, EVALUATIONS, "comments", "x", &Filter::new())
                .await;
        assert!(matches!(result, Err(StoreError::ForbiddenScan { .. })));
    }
}
