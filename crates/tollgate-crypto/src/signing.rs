use ed25519_dalek::Signer;
use ed25519_dalek::Verifier;

use tollgate_core::types::Promise;

use crate::error::CryptoError;
use crate::keys::{KeyPair, PublicKey};

/// Ed25519 signature (64 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    inner: ed25519_dalek::Signature,
}

impl Signature {
    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_arr: [u8; 64] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidInput(format!("signature must be 64 bytes, got {}", bytes.len()))
        })?;
        Ok(Self {
            inner: ed25519_dalek::Signature::from_bytes(&bytes_arr),
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

/// Sign a message using Ed25519.
pub fn sign(message: &[u8], keypair: &KeyPair) -> Signature {
    Signature {
        inner: keypair.signing_key().sign(message),
    }
}

/// Verify an Ed25519 signature.
pub fn verify(message: &[u8], signature: &Signature, pubkey: &PublicKey) -> Result<(), CryptoError> {
    pubkey
        .verifying_key()
        .verify(message, &signature.inner)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}

/// Sign a promise in place over its canonical payload.
pub fn sign_promise(promise: &mut Promise, keypair: &KeyPair) {
    let sig = sign(&promise.signing_payload(), keypair);
    promise.signature = sig.to_bytes().to_vec();
}

/// Check that `promise` carries a valid signature by `pubkey`.
pub fn verify_promise(promise: &Promise, pubkey: &PublicKey) -> Result<(), CryptoError> {
    if !promise.is_signed() {
        return Err(CryptoError::MissingSignature);
    }
    let sig = Signature::from_bytes(&promise.signature)?;
    verify(&promise.signing_payload(), &sig, pubkey)
}
