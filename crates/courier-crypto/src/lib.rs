pub mod address;
mod codec;
pub mod error;
pub mod identity;
pub mod sealed_sender;
pub mod sender_key;
pub mod signal;

pub use address::ProtocolAddress;
pub use error::CryptoError;
pub use identity::{Identity, IdentityKey};
pub use sealed_sender::{AccessKey, SenderCertificate, UnidentifiedContent};
pub use sender_key::{DistributionId, SenderKeyDistributionMessage, SenderKeyState};
pub use signal::SignalSessionManager;
