pub mod alphabet;
pub mod codec;
pub mod domain;
pub mod error;
pub mod hmac;
pub mod policy;
pub mod secrets;

pub use codec::Srs;
pub use domain::DomainTrie;
pub use error::SrsError;
pub use secrets::Secrets;
