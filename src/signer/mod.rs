//! Signing service
//!
//! The only path from an active key to a signature. Every signature is
//! checked against and recorded in slashing protection first.

pub mod validator;

pub use validator::ValidatorSigner;
