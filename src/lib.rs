//! TFTP (RFC 1350) server and client, over UDP or over length-framed TCP.

pub mod client;
pub mod config;
pub mod fsutil;
pub mod processor;
pub mod server;
pub mod srv_conn;
pub mod tftp;
pub mod transfer;
pub mod transport;

pub use client::{Client, ClientError};
pub use config::{Framing, ServerConfig, TransferConfig};
pub use processor::TransferSummary;
pub use server::{Server, ServerHandle, SessionInfo};
pub use tftp::{ErrorCode, Packet, TransferError};
