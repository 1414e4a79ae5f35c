pub mod broadcast;
pub mod channel_set;
pub mod endpoint;
pub mod events;
