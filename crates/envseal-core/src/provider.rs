//! The crypto oracle consumed by the client engine.
//!
//! Everything above this trait treats keys and ciphertexts as opaque. The
//! default [`DalekCrypto`] runs the primitives in [`crate::crypto`] inline.

use async_trait::async_trait;
use serde_json::Value;

use crate::canonical;
use crate::crypto::{
    self, EncryptedBlob, EncryptedData, Ed25519Signature, Keypair, Privkey, Pubkey, SymmetricKey,
};
use crate::error::{CoreError, Result};

/// Plaintext used by [`verify_keypair`].
const KEYPAIR_CHECK_PLAINTEXT: &[u8] = b"envseal keypair check";

/// Asymmetric and symmetric crypto operations.
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    async fn generate_keypair(&self) -> Result<Keypair>;

    async fn generate_symmetric_key(&self) -> Result<SymmetricKey>;

    /// Encrypt to `to_pubkey` and sign with `from_privkey`.
    async fn encrypt(
        &self,
        to_pubkey: &Pubkey,
        from_privkey: &Privkey,
        plaintext: &[u8],
    ) -> Result<EncryptedData>;

    /// Verify the signature of `from_pubkey`, then decrypt with `to_privkey`.
    async fn decrypt(
        &self,
        from_pubkey: &Pubkey,
        to_privkey: &Privkey,
        encrypted: &EncryptedData,
    ) -> Result<Vec<u8>>;

    async fn encrypt_with_key(&self, plaintext: &[u8], key: &SymmetricKey) -> Result<EncryptedBlob>;

    async fn decrypt_with_key(&self, blob: &EncryptedBlob, key: &SymmetricKey) -> Result<Vec<u8>>;

    async fn sign_public_key(&self, to_sign: &Pubkey, signer: &Privkey) -> Result<Pubkey>;

    async fn verify_public_key_signature(&self, signed: &Pubkey, signer: &Pubkey) -> Result<()>;

    async fn sign_json(&self, value: &Value, signer: &Privkey) -> Result<Ed25519Signature>;

    async fn verify_json(
        &self,
        value: &Value,
        signature: &Ed25519Signature,
        signer: &Pubkey,
    ) -> Result<()>;
}

/// Default provider backed by ed25519-dalek, x25519-dalek and ChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, Default)]
pub struct DalekCrypto;

#[async_trait]
impl CryptoProvider for DalekCrypto {
    async fn generate_keypair(&self) -> Result<Keypair> {
        Ok(Keypair::generate())
    }

    async fn generate_symmetric_key(&self) -> Result<SymmetricKey> {
        Ok(SymmetricKey::generate())
    }

    async fn encrypt(
        &self,
        to_pubkey: &Pubkey,
        from_privkey: &Privkey,
        plaintext: &[u8],
    ) -> Result<EncryptedData> {
        crypto::encrypt(to_pubkey, from_privkey, plaintext)
    }

    async fn decrypt(
        &self,
        from_pubkey: &Pubkey,
        to_privkey: &Privkey,
        encrypted: &EncryptedData,
    ) -> Result<Vec<u8>> {
        crypto::decrypt(from_pubkey, to_privkey, encrypted)
    }

    async fn encrypt_with_key(&self, plaintext: &[u8], key: &SymmetricKey) -> Result<EncryptedBlob> {
        crypto::encrypt_with_key(plaintext, key)
    }

    async fn decrypt_with_key(&self, blob: &EncryptedBlob, key: &SymmetricKey) -> Result<Vec<u8>> {
        crypto::decrypt_with_key(blob, key)
    }

    async fn sign_public_key(&self, to_sign: &Pubkey, signer: &Privkey) -> Result<Pubkey> {
        Ok(crypto::sign_public_key(to_sign, signer))
    }

    async fn verify_public_key_signature(&self, signed: &Pubkey, signer: &Pubkey) -> Result<()> {
        crypto::verify_public_key_signature(signed, signer)
    }

    async fn sign_json(&self, value: &Value, signer: &Privkey) -> Result<Ed25519Signature> {
        canonical::sign_json(value, signer)
    }

    async fn verify_json(
        &self,
        value: &Value,
        signature: &Ed25519Signature,
        signer: &Pubkey,
    ) -> Result<()> {
        canonical::verify_json(value, signature, signer)
    }
}

/// Round-trip a known plaintext through encrypt-to-self and decrypt.
///
/// Run whenever a privkey has just been decrypted, before it is used.
pub async fn verify_keypair(
    crypto: &dyn CryptoProvider,
    pubkey: &Pubkey,
    privkey: &Privkey,
) -> Result<()> {
    let encrypted = crypto
        .encrypt(pubkey, privkey, KEYPAIR_CHECK_PLAINTEXT)
        .await?;
    let decrypted = crypto.decrypt(pubkey, privkey, &encrypted).await?;
    if decrypted != KEYPAIR_CHECK_PLAINTEXT {
        return Err(CoreError::KeypairMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_verify_keypair_accepts_matching_pair() {
        let kp = DalekCrypto.generate_keypair().await.unwrap();
        verify_keypair(&DalekCrypto, &kp.pubkey, &kp.privkey)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_verify_keypair_rejects_mismatched_pair() {
        let a = DalekCrypto.generate_keypair().await.unwrap();
        let b = DalekCrypto.generate_keypair().await.unwrap();
        assert!(verify_keypair(&DalekCrypto, &a.pubkey, &b.privkey)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_provider_symmetric_roundtrip() {
        let key = DalekCrypto.generate_symmetric_key().await.unwrap();
        let blob = DalekCrypto.encrypt_with_key(b"{\"A\":\"1\"}", &key).await.unwrap();
        let plain = DalekCrypto.decrypt_with_key(&blob, &key).await.unwrap();
        assert_eq!(plain, b"{\"A\":\"1\"}");
    }
}
