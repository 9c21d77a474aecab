//! Unix-socket transport for the plugin protocol.

pub mod client;
pub mod codec;
pub mod server;

pub use client::DpClient;
pub use server::DpServer;
