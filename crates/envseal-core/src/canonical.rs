//! Canonical JSON encoding for signatures and identity hashes.
//!
//! Signed documents are serialized through [`serde_json::Value`], whose
//! object maps keep keys sorted. The same logical document therefore always
//! produces the same bytes regardless of field order in the source struct.
//! Each signing purpose gets its own domain prefix so a signature made for
//! one purpose can never be replayed for another.

use serde::Serialize;

use crate::crypto::{Blake3Hash, Ed25519Signature, Privkey, Pubkey};
use crate::error::Result;

/// Domain prefix for signed JSON documents.
pub const JSON_SIGN_DOMAIN: &[u8] = b"envseal-v1/json:";

/// Domain prefix for onboarding identity hashes.
pub const IDENTITY_HASH_DOMAIN: &[u8] = b"envseal-v1/identity:";

/// Encode `value` as canonical JSON bytes.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Canonical JSON prefixed with `domain`.
pub fn domain_bytes<T: Serialize + ?Sized>(domain: &[u8], value: &T) -> Result<Vec<u8>> {
    let body = canonical_json(value)?;
    let mut buf = Vec::with_capacity(domain.len() + body.len());
    buf.extend_from_slice(domain);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Sign the canonical JSON form of `value`.
pub fn sign_json<T: Serialize + ?Sized>(value: &T, signer: &Privkey) -> Result<Ed25519Signature> {
    Ok(signer.sign(&domain_bytes(JSON_SIGN_DOMAIN, value)?))
}

/// Verify a signature made by [`sign_json`].
pub fn verify_json<T: Serialize + ?Sized>(
    value: &T,
    signature: &Ed25519Signature,
    signer: &Pubkey,
) -> Result<()> {
    signer
        .keys
        .signing_key
        .verify(&domain_bytes(JSON_SIGN_DOMAIN, value)?, signature)
}

/// Blake3 hash of the canonical JSON form of `value` under the identity domain.
pub fn identity_hash<T: Serialize + ?Sized>(value: &T) -> Result<Blake3Hash> {
    Ok(Blake3Hash::hash(&domain_bytes(IDENTITY_HASH_DOMAIN, value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_change_bytes() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        let b = json!({"a": {"y": [1, 2], "z": true}, "b": 1});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }

    #[test]
    fn test_sign_verify_json() {
        let kp = Keypair::generate();
        let doc = json!({"userId": "u1", "envs": ["a", "b"]});

        let sig = sign_json(&doc, &kp.privkey).unwrap();
        verify_json(&doc, &sig, &kp.pubkey).unwrap();

        let altered = json!({"userId": "u2", "envs": ["a", "b"]});
        assert!(verify_json(&altered, &sig, &kp.pubkey).is_err());
    }

    #[test]
    fn test_json_signature_is_not_a_pubkey_signature() {
        let signer = Keypair::generate();
        let subject = Keypair::generate();

        // Signing the JSON form of a pubkey must not yield a valid countersignature
        let sig = sign_json(&subject.pubkey, &signer.privkey).unwrap();
        let forged = Pubkey {
            keys: subject.pubkey.keys,
            signature: Some(sig),
        };
        assert!(crate::crypto::verify_public_key_signature(&forged, &signer.pubkey).is_err());
    }

    #[test]
    fn test_identity_hash_stable() {
        let doc = json!({"id": "inv-1", "userId": "u1"});
        assert_eq!(identity_hash(&doc).unwrap(), identity_hash(&doc).unwrap());
        assert_ne!(
            identity_hash(&doc).unwrap(),
            identity_hash(&json!({"id": "inv-1", "userId": "u2"})).unwrap()
        );
    }
}
