pub mod cache;
pub mod verifier;
