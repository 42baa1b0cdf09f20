//! Client facing side: Debug Adapter Protocol messages and their transport.

pub mod client;
pub mod logger;
pub mod protocol;
pub mod tracer;
pub mod transport;
