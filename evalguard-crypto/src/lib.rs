//! Field-level envelope encryption for evaluation data.
//!
//! Every sensitive value gets its own AES-256-GCM data key; the data key is
//! wrapped under the operator's master key and stored next to the value.
//! Rotating the master key therefore only touches the wrapped keys (see
//! [`EnvelopeCipher::rewrap`]).
//!
//! # Quickstart
//! ```
//! use evalguard_crypto::{EnvelopeCipher, MasterKey};
//!
//! let cipher = EnvelopeCipher::new(MasterKey::generate());
//! let sealed = cipher.encrypt_value("Great teacher, very organized").unwrap();
//! assert_eq!(cipher.decrypt_value(&sealed).unwrap(), "Great teacher, very organized");
//! ```

pub mod cipher;
pub mod errors;
pub mod field;

pub use cipher::{EncryptedValue, EnvelopeCipher, MasterKey, FORMAT_VERSION};
pub use errors::{CipherError, CipherResult};
pub use field::{
    find_all_by_encrypted_field, find_by_encrypted_field, safe_decrypt, safe_decrypt_field,
    safe_encrypt, StoredField, DECRYPTION_PLACEHOLDER,
};
