pub mod memory_stores;
pub mod prekeys;
pub mod session;
pub mod store;
#[cfg(test)]
mod session_tests;

pub use memory_stores::{MemoryIdentityStore, MemoryPreKeyStore, MemorySessionStore};
pub use prekeys::{OneTimePreKey, PreKeyBundle};
pub use session::{
    CiphertextMessage, CiphertextMessageType, RemoteSession, SessionOutcome, SessionRecord,
    SignalSessionManager,
};
pub use store::{Direction, IdentityChange, IdentityKeyStore, PreKeyStore, SessionStore};
