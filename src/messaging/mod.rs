pub mod message;
pub mod receiver;
pub mod sender;
pub mod transport;
