pub mod config;
pub mod input;
pub mod protocol;
pub mod session;
pub mod streaming;
pub mod transport;
