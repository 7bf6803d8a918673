// notesync-common: shared types for the notesync workspace

pub mod awareness;
pub mod document;
pub mod protocol;
pub mod types;
