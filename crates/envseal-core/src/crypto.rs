//! Cryptographic primitives for envseal.
//!
//! Wraps Ed25519 signing, X25519 key agreement, ChaCha20-Poly1305
//! authenticated encryption and Blake3 hashing with strong types.
//!
//! A [`Pubkey`] bundles a signing key and an encryption key, plus an
//! optional countersignature from the keyable that vouched for it. The
//! matching [`Privkey`] never leaves the device unencrypted.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{CoreError, Result};

/// Domain prefix for pubkey countersignatures.
pub const PUBKEY_SIGN_DOMAIN: &[u8] = b"envseal-v1/pubkey:";

/// Domain prefix for signatures over asymmetric ciphertexts.
pub const BOX_SIGN_DOMAIN: &[u8] = b"envseal-v1/box:";

/// Blake3 derive-key context for box keys.
const BOX_KEY_CONTEXT: &str = "envseal-v1 box encryption key";

macro_rules! hex_array_serde {
    ($name:ident, $len:expr) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                let arr: [u8; $len] = bytes.try_into().map_err(|_| {
                    serde::de::Error::custom(concat!("expected ", stringify!($len), " bytes"))
                })?;
                Ok(Self(arr))
            }
        }
    };
}

/// Serde adapter for variable-length byte strings encoded as hex.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A 32-byte Blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Blake3Hash(pub [u8; 32]);

impl Blake3Hash {
    /// Compute the Blake3 hash of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3({})", &self.to_hex()[..16])
    }
}

hex_array_serde!(Blake3Hash, 32);

/// A 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ed25519PublicKey(pub [u8; 32]);

impl Ed25519PublicKey {
    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = Signature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Pub({})", &self.to_hex()[..16])
    }
}

hex_array_serde!(Ed25519PublicKey, 32);

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature(pub [u8; 64]);

impl Ed25519Signature {
    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Sig({}...)", &self.to_hex()[..16])
    }
}

hex_array_serde!(Ed25519Signature, 64);

/// An X25519 public key (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct X25519PublicKey(pub [u8; 32]);

impl X25519PublicKey {
    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Debug for X25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X25519Pub({})", &hex::encode(self.0)[..16])
    }
}

hex_array_serde!(X25519PublicKey, 32);

/// A 96-bit nonce for ChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionNonce(pub [u8; 12]);

impl EncryptionNonce {
    /// Generate a new random nonce.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

hex_array_serde!(EncryptionNonce, 12);

/// A 256-bit symmetric key for ChaCha20-Poly1305.
///
/// Lives in memory only. It is distributed exclusively wrapped in an
/// [`EncryptedData`] addressed to a verified recipient.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create from a decrypted byte slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            CoreError::InvalidKeyMaterial(format!(
                "invalid symmetric key length: expected 32, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn seal(&self, plaintext: &[u8], nonce: &EncryptionNonce) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CoreError::Encryption(e.to_string()))?;
        cipher
            .encrypt(Nonce::from_slice(&nonce.0), plaintext)
            .map_err(|e| CoreError::Encryption(e.to_string()))
    }

    fn open(&self, ciphertext: &[u8], nonce: &EncryptionNonce) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CoreError::Decryption(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce.0), ciphertext)
            .map_err(|e| CoreError::Decryption(e.to_string()))
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// The two public halves of a keyable's key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubkeyKeys {
    /// Ed25519 key used to verify signatures made by the holder.
    pub signing_key: Ed25519PublicKey,
    /// X25519 key used to encrypt to the holder.
    pub encryption_key: X25519PublicKey,
}

/// A keyable's public key, optionally countersigned by another keyable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pubkey {
    pub keys: PubkeyKeys,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Ed25519Signature>,
}

impl Pubkey {
    /// The bytes a countersignature covers.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PUBKEY_SIGN_DOMAIN.len() + 64);
        buf.extend_from_slice(PUBKEY_SIGN_DOMAIN);
        buf.extend_from_slice(self.keys.signing_key.as_bytes());
        buf.extend_from_slice(self.keys.encryption_key.as_bytes());
        buf
    }

    /// The same keys with any countersignature removed.
    pub fn unsigned(&self) -> Self {
        Self {
            keys: self.keys,
            signature: None,
        }
    }
}

/// A keyable's private key material: an Ed25519 signing key and an X25519
/// static secret.
#[derive(Clone)]
pub struct Privkey {
    signing: SigningKey,
    encryption: StaticSecret,
}

impl Privkey {
    /// Serialize to 64 raw bytes (signing seed followed by encryption secret).
    ///
    /// Callers must encrypt the result before it leaves the process.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.signing.to_bytes());
        out[32..].copy_from_slice(&self.encryption.to_bytes());
        out
    }

    /// Parse from the 64-byte form produced by [`Privkey::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            return Err(CoreError::InvalidKeyMaterial(format!(
                "invalid privkey length: expected 64, got {}",
                bytes.len()
            )));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes[..32]);
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&bytes[32..]);
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
            encryption: StaticSecret::from(secret),
        })
    }

    /// The unsigned public half.
    pub fn pubkey(&self) -> Pubkey {
        Pubkey {
            keys: PubkeyKeys {
                signing_key: Ed25519PublicKey(self.signing.verifying_key().to_bytes()),
                encryption_key: X25519PublicKey(*PublicKey::from(&self.encryption).as_bytes()),
            },
            signature: None,
        }
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Ed25519Signature(self.signing.sign(message).to_bytes())
    }

    fn box_key(&self, peer: &X25519PublicKey) -> SymmetricKey {
        let shared = self.encryption.diffie_hellman(&peer.to_dalek());
        let mut hasher = blake3::Hasher::new_derive_key(BOX_KEY_CONTEXT);
        hasher.update(shared.as_bytes());
        SymmetricKey(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for Privkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Privkey({:?})", self.pubkey().keys.signing_key)
    }
}

/// A pubkey together with its privkey.
#[derive(Clone, Debug)]
pub struct Keypair {
    pub pubkey: Pubkey,
    pub privkey: Privkey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let signing = SigningKey::generate(&mut rng);
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        Self::from_privkey(Privkey {
            signing,
            encryption: StaticSecret::from(secret),
        })
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key("envseal-v1 keypair seed");
        hasher.update(seed);
        let secret = *hasher.finalize().as_bytes();
        Self::from_privkey(Privkey {
            signing: SigningKey::from_bytes(seed),
            encryption: StaticSecret::from(secret),
        })
    }

    fn from_privkey(privkey: Privkey) -> Self {
        Self {
            pubkey: privkey.pubkey(),
            privkey,
        }
    }
}

/// An asymmetric envelope: ciphertext readable only by the recipient,
/// signed by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub nonce: EncryptionNonce,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub signature: Ed25519Signature,
}

impl EncryptedData {
    fn signed_bytes(nonce: &EncryptionNonce, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BOX_SIGN_DOMAIN.len() + 12 + data.len());
        buf.extend_from_slice(BOX_SIGN_DOMAIN);
        buf.extend_from_slice(&nonce.0);
        buf.extend_from_slice(data);
        buf
    }
}

/// A symmetric envelope produced with a [`SymmetricKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub nonce: EncryptionNonce,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl EncryptedBlob {
    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CoreError::Encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::Decoding(e.to_string()))
    }
}

/// Encrypt `plaintext` from `sender` to `recipient`, then sign the ciphertext.
pub fn encrypt(recipient: &Pubkey, sender: &Privkey, plaintext: &[u8]) -> Result<EncryptedData> {
    let key = sender.box_key(&recipient.keys.encryption_key);
    let nonce = EncryptionNonce::generate();
    let data = key.seal(plaintext, &nonce)?;
    let signature = sender.sign(&EncryptedData::signed_bytes(&nonce, &data));
    Ok(EncryptedData {
        nonce,
        data,
        signature,
    })
}

/// Verify the sender's signature, then decrypt with the recipient's privkey.
pub fn decrypt(sender: &Pubkey, recipient: &Privkey, encrypted: &EncryptedData) -> Result<Vec<u8>> {
    sender.keys.signing_key.verify(
        &EncryptedData::signed_bytes(&encrypted.nonce, &encrypted.data),
        &encrypted.signature,
    )?;
    let key = recipient.box_key(&sender.keys.encryption_key);
    key.open(&encrypted.data, &encrypted.nonce)
}

/// Encrypt `plaintext` with a symmetric key.
pub fn encrypt_with_key(plaintext: &[u8], key: &SymmetricKey) -> Result<EncryptedBlob> {
    let nonce = EncryptionNonce::generate();
    let data = key.seal(plaintext, &nonce)?;
    Ok(EncryptedBlob { nonce, data })
}

/// Decrypt a blob with a symmetric key.
pub fn decrypt_with_key(blob: &EncryptedBlob, key: &SymmetricKey) -> Result<Vec<u8>> {
    key.open(&blob.data, &blob.nonce)
}

/// Countersign `to_sign` with `signer`, replacing any previous signature.
pub fn sign_public_key(to_sign: &Pubkey, signer: &Privkey) -> Pubkey {
    let unsigned = to_sign.unsigned();
    let signature = signer.sign(&unsigned.signing_bytes());
    Pubkey {
        keys: unsigned.keys,
        signature: Some(signature),
    }
}

/// Check that `signed` carries a countersignature made by `signer`.
pub fn verify_public_key_signature(signed: &Pubkey, signer: &Pubkey) -> Result<()> {
    let signature = signed.signature.as_ref().ok_or(CoreError::MissingSignature)?;
    signer
        .keys
        .signing_key
        .verify(&signed.signing_bytes(), signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_box_roundtrip() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let encrypted = encrypt(&bob.pubkey, &alice.privkey, b"hello bob").unwrap();
        let decrypted = decrypt(&alice.pubkey, &bob.privkey, &encrypted).unwrap();

        assert_eq!(decrypted, b"hello bob");
    }

    #[test]
    fn test_box_wrong_recipient_fails() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let eve = Keypair::generate();

        let encrypted = encrypt(&bob.pubkey, &alice.privkey, b"secret").unwrap();

        assert!(decrypt(&alice.pubkey, &eve.privkey, &encrypted).is_err());
    }

    #[test]
    fn test_box_forged_sender_fails() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let mallory = Keypair::generate();

        let encrypted = encrypt(&bob.pubkey, &mallory.privkey, b"trust me").unwrap();

        // Claimed sender does not match the signature
        let err = decrypt(&alice.pubkey, &bob.privkey, &encrypted).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSignature));
    }

    #[test]
    fn test_box_tampered_ciphertext_fails() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let mut encrypted = encrypt(&bob.pubkey, &alice.privkey, b"payload").unwrap();
        encrypted.data[0] ^= 0xff;

        assert!(decrypt(&alice.pubkey, &bob.privkey, &encrypted).is_err());
    }

    #[test]
    fn test_symmetric_wrong_key_fails() {
        let key1 = SymmetricKey::generate();
        let key2 = SymmetricKey::generate();

        let blob = encrypt_with_key(b"secret", &key1).unwrap();

        assert!(decrypt_with_key(&blob, &key2).is_err());
    }

    #[test]
    fn test_sign_and_verify_pubkey() {
        let signer = Keypair::generate();
        let subject = Keypair::generate();

        let signed = sign_public_key(&subject.pubkey, &signer.privkey);
        verify_public_key_signature(&signed, &signer.pubkey).unwrap();

        let other = Keypair::generate();
        assert!(verify_public_key_signature(&signed, &other.pubkey).is_err());
    }

    #[test]
    fn test_unsigned_pubkey_fails_verification() {
        let signer = Keypair::generate();
        let subject = Keypair::generate();

        let err = verify_public_key_signature(&subject.pubkey, &signer.pubkey).unwrap_err();
        assert!(matches!(err, CoreError::MissingSignature));
    }

    #[test]
    fn test_privkey_bytes_roundtrip() {
        let keypair = Keypair::generate();
        let restored = Privkey::from_bytes(&keypair.privkey.to_bytes()).unwrap();
        assert_eq!(restored.pubkey(), keypair.pubkey);
    }

    #[test]
    fn test_keypair_deterministic_from_seed() {
        let kp1 = Keypair::from_seed(&[0x42; 32]);
        let kp2 = Keypair::from_seed(&[0x42; 32]);
        assert_eq!(kp1.pubkey, kp2.pubkey);
    }

    #[test]
    fn test_pubkey_json_roundtrip() {
        let signer = Keypair::generate();
        let signed = sign_public_key(&Keypair::generate().pubkey, &signer.privkey);

        let json = serde_json::to_string(&signed).unwrap();
        let recovered: Pubkey = serde_json::from_str(&json).unwrap();

        assert_eq!(signed, recovered);
    }

    #[test]
    fn test_blob_cbor_roundtrip() {
        let blob = encrypt_with_key(b"cbor", &SymmetricKey::generate()).unwrap();
        let recovered = EncryptedBlob::from_bytes(&blob.to_bytes().unwrap()).unwrap();
        assert_eq!(blob, recovered);
    }

    proptest! {
        #[test]
        fn envelope_roundtrip(
            sender_seed in any::<[u8; 32]>(),
            recipient_seed in any::<[u8; 32]>(),
            key_bytes in any::<[u8; 32]>(),
            plaintext in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let sender = Keypair::from_seed(&sender_seed);
            let recipient = Keypair::from_seed(&recipient_seed);
            let key = SymmetricKey::from_bytes(key_bytes);

            let wrapped = encrypt(&recipient.pubkey, &sender.privkey, key.as_bytes()).unwrap();
            let unwrapped = decrypt(&sender.pubkey, &recipient.privkey, &wrapped).unwrap();
            prop_assert_eq!(&unwrapped[..], &key_bytes[..]);

            let blob = encrypt_with_key(&plaintext, &key).unwrap();
            let opened = decrypt_with_key(&blob, &SymmetricKey::from_slice(&unwrapped).unwrap()).unwrap();
            prop_assert_eq!(opened, plaintext);
        }
    }
}
