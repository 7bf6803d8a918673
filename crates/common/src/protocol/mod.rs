// Wire contracts between the relay, the client and the notes store.

pub mod close;
pub mod verify;

pub use close::CloseReason;
pub use verify::{VerifyRequest, VerifyResponse};
