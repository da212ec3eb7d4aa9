pub mod conversation;
pub mod message;
pub mod profile;

pub use conversation::*;
pub use message::*;
pub use profile::*;
