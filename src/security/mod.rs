pub mod classify;
pub mod rotation;
pub mod rotation_lock;
pub mod token_store;
