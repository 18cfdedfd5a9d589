//! Key material and the DIDComm v1 envelope primitives.
//!
//! The envelope layout follows the "pack" format consumed by existing
//! DIDComm v1 agents: a JSON object with a base64url `protected` header
//! carrying per-recipient key material, plus `iv`, `ciphertext` and a
//! detached `tag`. The content encryption key is boxed (authcrypt) or
//! sealed (anoncrypt) to each recipient's x25519 form of their ed25519
//! verification key; the payload itself is encrypted with
//! ChaCha20-Poly1305 using the encoded protected header as AAD.

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key as ContentKey, Nonce as ContentNonce,
};
use crypto_box::{aead::generic_array::GenericArray, PublicKey, SalsaBox, SecretKey};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::SigningKey;
use rand::{rngs::OsRng, RngCore};
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use thiserror::Error;

pub const VERKEY_SIZE: usize = 32;
pub const SIGKEY_SIZE: usize = 64;

const CEK_SIZE: usize = 32;
const CONTENT_NONCE_SIZE: usize = 12;
const BOX_NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The input is not a well-formed pack envelope addressed to us. The
    /// connection downgrades this class of failure to a plaintext parse.
    #[error("malformed message envelope: {0}")]
    MalformedEnvelope(String),

    #[error("failed to encrypt: {0}")]
    Encryption(String),

    #[error("failed to decrypt: {0}")]
    Decryption(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Key material accepted either as raw bytes or as base58 text, normalized
/// to bytes at the API boundary.
#[derive(Debug, Clone)]
pub enum KeyInput {
    Bytes(Vec<u8>),
    Base58(String),
}

impl KeyInput {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        match self {
            KeyInput::Bytes(bytes) => Ok(bytes.clone()),
            KeyInput::Base58(b58) => b58_to_bytes(b58),
        }
    }
}

impl From<Vec<u8>> for KeyInput {
    fn from(bytes: Vec<u8>) -> Self {
        KeyInput::Bytes(bytes)
    }
}

impl From<&[u8]> for KeyInput {
    fn from(bytes: &[u8]) -> Self {
        KeyInput::Bytes(bytes.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for KeyInput {
    fn from(bytes: [u8; N]) -> Self {
        KeyInput::Bytes(bytes.to_vec())
    }
}

impl From<&str> for KeyInput {
    fn from(b58: &str) -> Self {
        KeyInput::Base58(b58.to_owned())
    }
}

impl From<String> for KeyInput {
    fn from(b58: String) -> Self {
        KeyInput::Base58(b58)
    }
}

/// The connection's ed25519 key pair. `sigkey` is the 64-byte expanded
/// form (seed followed by the public key). Never mutated after
/// construction.
#[derive(Clone)]
pub struct KeyPair {
    verkey: Vec<u8>,
    sigkey: Vec<u8>,
}

impl KeyPair {
    pub fn new(
        verkey: impl Into<KeyInput>,
        sigkey: impl Into<KeyInput>,
    ) -> Result<Self, CryptoError> {
        let verkey = verkey.into().to_bytes()?;
        let sigkey = sigkey.into().to_bytes()?;
        if verkey.len() != VERKEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "verification key must be {} bytes, got {}",
                VERKEY_SIZE,
                verkey.len()
            )));
        }
        if sigkey.len() != SIGKEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "signing key must be {} bytes, got {}",
                SIGKEY_SIZE,
                sigkey.len()
            )));
        }
        Ok(Self { verkey, sigkey })
    }

    /// Generate a fresh ed25519 key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(&signing_key)
    }

    /// Derive the key pair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(&SigningKey::from_bytes(seed))
    }

    fn from_signing_key(signing_key: &SigningKey) -> Self {
        Self {
            verkey: signing_key.verifying_key().to_bytes().to_vec(),
            sigkey: signing_key.to_keypair_bytes().to_vec(),
        }
    }

    pub fn verkey(&self) -> &[u8] {
        &self.verkey
    }

    pub fn sigkey(&self) -> &[u8] {
        &self.sigkey
    }

    pub fn verkey_b58(&self) -> String {
        bytes_to_b58(&self.verkey)
    }

    /// Verkey-derived DID: base58 of the first 16 bytes of the verkey.
    pub fn did(&self) -> String {
        bytes_to_b58(&self.verkey[..16])
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("verkey", &self.verkey_b58())
            .field("sigkey", &"<elided>")
            .finish()
    }
}

pub fn bytes_to_b58(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

pub fn b58_to_bytes(b58: &str) -> Result<Vec<u8>, CryptoError> {
    bs58::decode(b58)
        .into_vec()
        .map_err(|err| CryptoError::InvalidKey(format!("invalid base58 key `{b58}`: {err}")))
}

/// Convert an ed25519 verification key to its x25519 (Montgomery) form.
fn vk_to_curve25519(verkey: &[u8]) -> Result<PublicKey, CryptoError> {
    let bytes: [u8; 32] = verkey.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!(
            "verification key must be {} bytes, got {}",
            VERKEY_SIZE,
            verkey.len()
        ))
    })?;
    let point = CompressedEdwardsY(bytes)
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("not a valid ed25519 public key".into()))?;
    Ok(PublicKey::from(point.to_montgomery().to_bytes()))
}

/// Convert an ed25519 signing key (expanded form) to an x25519 secret:
/// SHA-512 over the seed, clamped.
fn sk_to_curve25519(sigkey: &[u8]) -> Result<SecretKey, CryptoError> {
    if sigkey.len() != SIGKEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "signing key must be {} bytes, got {}",
            SIGKEY_SIZE,
            sigkey.len()
        )));
    }
    let digest = Sha512::digest(&sigkey[..32]);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&digest[..32]);
    secret[0] &= 248;
    secret[31] &= 127;
    secret[31] |= 64;
    Ok(SecretKey::from(secret))
}

/// Encrypt `payload` to `to_verkeys`, producing a pack envelope as a JSON
/// value. With `sender` key material the envelope is authcrypted (the
/// recipient learns the sender verkey); without, anoncrypted.
pub fn pack_message(
    payload: &[u8],
    to_verkeys: &[Vec<u8>],
    sender: Option<(&[u8], &[u8])>,
) -> Result<Value, CryptoError> {
    let mut cek = [0u8; CEK_SIZE];
    OsRng.fill_bytes(&mut cek);

    let mut recipients = Vec::with_capacity(to_verkeys.len());
    for target_vk in to_verkeys {
        let target_pk = vk_to_curve25519(target_vk)?;
        let entry = match sender {
            Some((sender_vk, sender_sk)) => {
                let sender_vk_b58 = bytes_to_b58(sender_vk);
                let enc_sender = target_pk
                    .seal(&mut OsRng, sender_vk_b58.as_bytes())
                    .map_err(|_| CryptoError::Encryption("failed to seal sender key".into()))?;

                let sender_curve_sk = sk_to_curve25519(sender_sk)?;
                let mut nonce = [0u8; BOX_NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce);
                let enc_cek = SalsaBox::new(&target_pk, &sender_curve_sk)
                    .encrypt(GenericArray::from_slice(&nonce), &cek[..])
                    .map_err(|_| {
                        CryptoError::Encryption("failed to box content encryption key".into())
                    })?;

                json!({
                    "encrypted_key": URL_SAFE.encode(&enc_cek),
                    "header": {
                        "kid": bytes_to_b58(target_vk),
                        "sender": URL_SAFE.encode(&enc_sender),
                        "iv": URL_SAFE.encode(nonce),
                    },
                })
            }
            None => {
                let enc_cek = target_pk.seal(&mut OsRng, &cek[..]).map_err(|_| {
                    CryptoError::Encryption("failed to seal content encryption key".into())
                })?;
                json!({
                    "encrypted_key": URL_SAFE.encode(&enc_cek),
                    "header": { "kid": bytes_to_b58(target_vk) },
                })
            }
        };
        recipients.push(entry);
    }

    let protected = json!({
        "enc": "xchacha20poly1305_ietf",
        "typ": "JWM/1.0",
        "alg": if sender.is_some() { "Authcrypt" } else { "Anoncrypt" },
        "recipients": recipients,
    });
    let protected_b64 = URL_SAFE.encode(protected.to_string());

    let mut iv = [0u8; CONTENT_NONCE_SIZE];
    OsRng.fill_bytes(&mut iv);
    let cipher = ChaCha20Poly1305::new(ContentKey::from_slice(&cek));
    let mut ciphertext = cipher
        .encrypt(
            ContentNonce::from_slice(&iv),
            Payload {
                msg: payload,
                aad: protected_b64.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::Encryption("failed to encrypt payload".into()))?;
    let tag = ciphertext.split_off(ciphertext.len() - TAG_SIZE);

    Ok(json!({
        "protected": protected_b64,
        "iv": URL_SAFE.encode(iv),
        "ciphertext": URL_SAFE.encode(&ciphertext),
        "tag": URL_SAFE.encode(&tag),
    }))
}

/// Decrypt a pack envelope with our key pair. Returns the decrypted
/// payload, the sender verkey when the envelope was authcrypted, and the
/// recipient verkey the envelope was opened with.
pub fn unpack_message(
    packed: &[u8],
    my_verkey: &[u8],
    my_sigkey: &[u8],
) -> Result<(Vec<u8>, Option<Vec<u8>>, Vec<u8>), CryptoError> {
    let envelope: Value = serde_json::from_slice(packed)
        .map_err(|err| CryptoError::MalformedEnvelope(format!("invalid envelope JSON: {err}")))?;
    unpack_message_value(&envelope, my_verkey, my_sigkey)
}

/// As [`unpack_message`], over an already-parsed envelope.
pub fn unpack_message_value(
    envelope: &Value,
    my_verkey: &[u8],
    my_sigkey: &[u8],
) -> Result<(Vec<u8>, Option<Vec<u8>>, Vec<u8>), CryptoError> {
    let protected_b64 = envelope
        .get("protected")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing `protected` header"))?;
    let protected: Value = serde_json::from_slice(&decode_b64(protected_b64, "protected")?)
        .map_err(|err| malformed(format!("invalid protected header JSON: {err}")))?;

    let is_authcrypt = match protected.get("alg").and_then(Value::as_str) {
        Some("Authcrypt") => true,
        Some("Anoncrypt") => false,
        Some(other) => return Err(malformed(format!("unsupported pack algorithm `{other}`"))),
        None => return Err(malformed("missing `alg` in protected header")),
    };

    let recipients = protected
        .get("recipients")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing `recipients` in protected header"))?;
    let my_vk_b58 = bytes_to_b58(my_verkey);
    let recipient = recipients
        .iter()
        .find(|entry| {
            entry
                .pointer("/header/kid")
                .and_then(Value::as_str)
                .is_some_and(|kid| kid == my_vk_b58)
        })
        .ok_or_else(|| malformed("no corresponding recipient key found"))?;

    let enc_cek = recipient
        .get("encrypted_key")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing `encrypted_key` for recipient"))
        .and_then(|b64| decode_b64(b64, "encrypted_key"))?;

    let my_sk = sk_to_curve25519(my_sigkey)?;

    let (cek, sender_vk) = if is_authcrypt {
        let enc_sender = recipient
            .pointer("/header/sender")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("authcrypt envelope without `sender` header"))
            .and_then(|b64| decode_b64(b64, "sender"))?;
        let nonce = recipient
            .pointer("/header/iv")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("authcrypt envelope without `iv` header"))
            .and_then(|b64| decode_b64(b64, "iv"))?;
        if nonce.len() != BOX_NONCE_SIZE {
            return Err(malformed("recipient `iv` has the wrong length"));
        }

        let sender_vk_b58 = my_sk
            .unseal(&enc_sender)
            .map_err(|_| CryptoError::Decryption("failed to open sealed sender key".into()))?;
        let sender_vk_b58 = String::from_utf8(sender_vk_b58)
            .map_err(|_| malformed("sealed sender key is not valid text"))?;
        let sender_vk = b58_to_bytes(&sender_vk_b58)
            .map_err(|_| malformed("sealed sender key is not valid base58"))?;
        let sender_pk = vk_to_curve25519(&sender_vk)?;

        let cek = SalsaBox::new(&sender_pk, &my_sk)
            .decrypt(GenericArray::from_slice(&nonce), &enc_cek[..])
            .map_err(|_| {
                CryptoError::Decryption("failed to unbox content encryption key".into())
            })?;
        (cek, Some(sender_vk))
    } else {
        let cek = my_sk.unseal(&enc_cek).map_err(|_| {
            CryptoError::Decryption("failed to unseal content encryption key".into())
        })?;
        (cek, None)
    };

    let iv = envelope
        .get("iv")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing `iv`"))
        .and_then(|b64| decode_b64(b64, "iv"))?;
    if iv.len() != CONTENT_NONCE_SIZE {
        return Err(malformed("content `iv` has the wrong length"));
    }
    let mut ciphertext = envelope
        .get("ciphertext")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing `ciphertext`"))
        .and_then(|b64| decode_b64(b64, "ciphertext"))?;
    let tag = envelope
        .get("tag")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing `tag`"))
        .and_then(|b64| decode_b64(b64, "tag"))?;
    ciphertext.extend_from_slice(&tag);

    let cipher = ChaCha20Poly1305::new_from_slice(&cek)
        .map_err(|_| CryptoError::Decryption("content encryption key has the wrong length".into()))?;
    let payload = cipher
        .decrypt(
            ContentNonce::from_slice(&iv),
            Payload {
                msg: &ciphertext,
                aad: protected_b64.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::Decryption("failed to decrypt payload".into()))?;

    Ok((payload, sender_vk, my_verkey.to_vec()))
}

fn malformed(reason: impl Into<String>) -> CryptoError {
    CryptoError::MalformedEnvelope(reason.into())
}

fn decode_b64(value: &str, field: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE
        .decode(value)
        .map_err(|err| malformed(format!("invalid base64 in `{field}`: {err}")))
}
