// notesync-relay library entry point.

pub mod app;
pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod session;
pub mod shutdown;
pub mod ws;
