pub mod auth;
pub mod conversation_key;
pub mod events;
pub mod identity;
pub mod messaging;
pub mod notify;
pub mod permissions;
