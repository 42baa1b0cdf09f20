//! Runtime side: the debug service object model and its RPC client.

pub mod service;
pub mod types;
pub mod ws;
