pub mod error;
pub mod hashing;
pub mod keys;
pub mod signing;

pub use error::CryptoError;
pub use hashing::{derive_address, hash, Hash};
pub use keys::{KeyPair, PublicKey};
pub use signing::{sign, sign_promise, verify, verify_promise, Signature};
