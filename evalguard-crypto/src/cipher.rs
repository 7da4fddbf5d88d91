use std::fmt;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce, Tag};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::errors::{CipherError, CipherResult};

/// AES-256-GCM with a 128-bit iv and a 128-bit tag.
type FieldCipher = AesGcm<Aes256, U16>;

pub const FORMAT_VERSION: &str = "envelope-v1";

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Operator-held key that wraps every per-value data key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Parses exactly 64 hex characters (256 bits).
    pub fn from_hex(encoded: &str) -> CipherResult<Self> {
        let encoded = encoded.trim();
        if encoded.len() != KEY_LEN * 2 {
            return Err(CipherError::Configuration(format!(
                "master key must be {} hex characters, got {}",
                KEY_LEN * 2,
                encoded.len()
            )));
        }
        let bytes = Zeroizing::new(hex::decode(encoded).map_err(|_| {
            CipherError::Configuration("master key is not valid hex".into())
        })?);
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Persisted form of an encrypted field. All byte fields are base64.
///
/// `auth_tag` is the value tag followed by the key-wrap tag, 16 bytes each.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedValue {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
    pub wrapped_data_key: String,
    pub data_key_iv: String,
    pub format_version: String,
}

impl EncryptedValue {
    /// Structural check only: version, base64 and field lengths. Says
    /// nothing about whether the tags verify.
    pub fn is_well_formed(&self) -> bool {
        self.format_version == FORMAT_VERSION && decode_envelope(self).is_ok()
    }

    /// Recognizes a JSON object shaped like an envelope.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value::<EncryptedValue>(value.clone())
            .ok()
            .filter(EncryptedValue::is_well_formed)
    }
}

#[derive(Clone, Default)]
pub struct EnvelopeCipher {
    master_key: Option<MasterKey>,
}

impl fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeCipher")
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl EnvelopeCipher {
    pub fn new(master_key: MasterKey) -> Self {
        Self {
            master_key: Some(master_key),
        }
    }

    pub fn unconfigured() -> Self {
        Self { master_key: None }
    }

    /// Strict constructor: a malformed key is an error.
    pub fn from_hex(encoded: &str) -> CipherResult<Self> {
        MasterKey::from_hex(encoded).map(Self::new)
    }

    /// Lenient constructor: a missing or malformed key yields an
    /// unconfigured cipher, which [`EnvelopeCipher::is_configured`] reports.
    pub fn from_optional_hex(encoded: Option<&str>) -> Self {
        match encoded {
            None => {
                debug!("no master key supplied, field encryption disabled");
                Self::unconfigured()
            }
            Some(raw) => match MasterKey::from_hex(raw) {
                Ok(key) => Self::new(key),
                Err(err) => {
                    warn!(error = %err, "master key rejected, field encryption disabled");
                    Self::unconfigured()
                }
            },
        }
    }

    pub fn from_env(var: &str) -> Self {
        let raw = std::env::var(var).ok();
        Self::from_optional_hex(raw.as_deref())
    }

    pub fn is_configured(&self) -> bool {
        self.master_key.is_some()
    }

    pub fn encrypt_value(&self, plaintext: &str) -> CipherResult<EncryptedValue> {
        let master = self.master()?;
        if plaintext.is_empty() {
            return Err(CipherError::Input("plaintext must not be empty"));
        }

        let data_key = Zeroizing::new(random_bytes::<KEY_LEN>());
        let iv = random_bytes::<IV_LEN>();
        let mut ciphertext = plaintext.as_bytes().to_vec();
        let value_tag = seal(&data_key[..], &iv, &mut ciphertext)?;

        let (wrapped_data_key, data_key_iv, key_tag) = wrap_data_key(master, &data_key[..])?;

        Ok(EncryptedValue {
            ciphertext: BASE64.encode(&ciphertext),
            iv: BASE64.encode(iv),
            auth_tag: BASE64.encode(join_tags(&value_tag, &key_tag)),
            wrapped_data_key: BASE64.encode(wrapped_data_key),
            data_key_iv: BASE64.encode(data_key_iv),
            format_version: FORMAT_VERSION.to_owned(),
        })
    }

    pub fn decrypt_value(&self, value: &EncryptedValue) -> CipherResult<String> {
        let master = self.master()?;
        let mut envelope = decode_envelope(value)?;
        let data_key = unwrap_data_key(master, &envelope)?;
        open(
            &data_key[..],
            &envelope.iv,
            &envelope.value_tag,
            &mut envelope.ciphertext,
        )?;
        String::from_utf8(std::mem::take(&mut envelope.ciphertext))
            .map_err(|_| CipherError::Decryption)
    }

    /// Re-wraps the data key under `target`'s master key. The value
    /// ciphertext, its iv and the value half of the tag are unchanged.
    pub fn rewrap(
        &self,
        value: &EncryptedValue,
        target: &EnvelopeCipher,
    ) -> CipherResult<EncryptedValue> {
        let master = self.master()?;
        let target_master = target.master()?;
        let envelope = decode_envelope(value)?;
        let data_key = unwrap_data_key(master, &envelope)?;
        let (wrapped_data_key, data_key_iv, key_tag) =
            wrap_data_key(target_master, &data_key[..])?;
        Ok(EncryptedValue {
            ciphertext: value.ciphertext.clone(),
            iv: value.iv.clone(),
            auth_tag: BASE64.encode(join_tags(&envelope.value_tag, &key_tag)),
            wrapped_data_key: BASE64.encode(wrapped_data_key),
            data_key_iv: BASE64.encode(data_key_iv),
            format_version: FORMAT_VERSION.to_owned(),
        })
    }

    fn master(&self) -> CipherResult<&MasterKey> {
        self.master_key
            .as_ref()
            .ok_or_else(|| CipherError::Configuration("master key not configured".into()))
    }
}

struct DecodedEnvelope {
    ciphertext: Vec<u8>,
    iv: Vec<u8>,
    value_tag: Vec<u8>,
    key_tag: Vec<u8>,
    wrapped_data_key: Vec<u8>,
    data_key_iv: Vec<u8>,
}

fn decode_envelope(value: &EncryptedValue) -> CipherResult<DecodedEnvelope> {
    if value.format_version != FORMAT_VERSION {
        return Err(CipherError::Decryption);
    }
    let decode = |field: &str| BASE64.decode(field).map_err(|_| CipherError::Decryption);
    let ciphertext = decode(&value.ciphertext)?;
    let iv = decode(&value.iv)?;
    let mut value_tag = decode(&value.auth_tag)?;
    let wrapped_data_key = decode(&value.wrapped_data_key)?;
    let data_key_iv = decode(&value.data_key_iv)?;

    if ciphertext.is_empty()
        || iv.len() != IV_LEN
        || data_key_iv.len() != IV_LEN
        || value_tag.len() != TAG_LEN * 2
        || wrapped_data_key.len() != KEY_LEN
    {
        return Err(CipherError::Decryption);
    }
    let key_tag = value_tag.split_off(TAG_LEN);

    Ok(DecodedEnvelope {
        ciphertext,
        iv,
        value_tag,
        key_tag,
        wrapped_data_key,
        data_key_iv,
    })
}

fn wrap_data_key(
    master: &MasterKey,
    data_key: &[u8],
) -> CipherResult<(Vec<u8>, [u8; IV_LEN], [u8; TAG_LEN])> {
    let iv = random_bytes::<IV_LEN>();
    let mut wrapped = data_key.to_vec();
    let tag = seal(master.as_bytes(), &iv, &mut wrapped)?;
    Ok((wrapped, iv, tag))
}

fn unwrap_data_key(
    master: &MasterKey,
    envelope: &DecodedEnvelope,
) -> CipherResult<Zeroizing<Vec<u8>>> {
    let mut data_key = Zeroizing::new(envelope.wrapped_data_key.clone());
    open(
        master.as_bytes(),
        &envelope.data_key_iv,
        &envelope.key_tag,
        &mut data_key,
    )?;
    Ok(data_key)
}

fn seal(key: &[u8], iv: &[u8; IV_LEN], buffer: &mut [u8]) -> CipherResult<[u8; TAG_LEN]> {
    let cipher = FieldCipher::new_from_slice(key)
        .map_err(|_| CipherError::Configuration("invalid aes-256 key length".into()))?;
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<U16>::from_slice(iv), b"", buffer)
        .map_err(|_| CipherError::Input("value too large to encrypt"))?;
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&tag);
    Ok(out)
}

fn open(key: &[u8], iv: &[u8], tag: &[u8], buffer: &mut [u8]) -> CipherResult<()> {
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(CipherError::Decryption);
    }
    let cipher = FieldCipher::new_from_slice(key).map_err(|_| CipherError::Decryption)?;
    cipher
        .decrypt_in_place_detached(
            Nonce::<U16>::from_slice(iv),
            b"",
            buffer,
            Tag::<U16>::from_slice(tag),
        )
        .map_err(|_| CipherError::Decryption)
}

fn join_tags(value_tag: &[u8], key_tag: &[u8]) -> Vec<u8> {
    let mut tags = Vec::with_capacity(TAG_LEN * 2);
    tags.extend_from_slice(value_tag);
    tags.extend_from_slice(key_tag);
    tags
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
