pub mod conversation;
pub mod envelope;
pub mod lead;
pub mod message;
pub mod slot;
pub mod step;
