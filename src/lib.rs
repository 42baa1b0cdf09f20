pub mod adapter;
pub mod config;
pub mod connect;
pub mod convert;
pub mod dap;
pub mod error;
pub mod evaluate_name;
pub mod events;
pub mod gate;
pub mod isolates;
pub mod launcher;
pub mod log;
pub mod proxy;
pub mod refs;
pub mod server;
pub mod vm;
