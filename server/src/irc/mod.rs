pub mod chat;
pub mod framer;
pub mod link;
pub mod parser;
pub mod send_queue;
