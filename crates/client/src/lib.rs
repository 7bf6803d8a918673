// notesync-client library entry point.

pub mod api;
pub mod cache;
pub mod config;
pub mod presence;
pub mod replica;
pub mod session;
