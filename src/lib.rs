pub mod backend;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod server;
pub mod service;
pub mod session;
pub mod signer;
pub mod types;
