pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod logging;
pub mod message;
pub mod pending;
pub mod recent_failures;
pub mod recovery;
pub mod relay;
pub mod sender;
pub mod services;
pub mod store;
pub mod thread;

pub use config::SenderConfig;
pub use error::{RelayError, SendError, StoreError};
pub use ids::{Address, DeviceId, LocalAccount, ServiceId, ThreadId};
pub use message::{MessageKind, OutgoingMessage, RecipientState};
pub use pending::PendingSends;
pub use sender::{MessageSender, SendMessageFailure, SendResult, SenderServices};
pub use thread::{GroupThread, Thread};
