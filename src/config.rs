use crate::tftp;
use anyhow::{bail, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Default port the server listens on.
pub const DEFAULT_PORT: u16 = 6969;

/// Knobs of the stop-and-wait engine, shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Payload size of every Data packet but the last.
    pub block_size: usize,

    /// How long to wait for the peer before retransmitting.
    pub timeout: Duration,

    /// Retransmissions allowed per block before the transfer is abandoned.
    pub max_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            block_size: tftp::DEFAULT_BLOCK_SIZE,
            timeout: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > tftp::MAX_FRAME_PAYLOAD {
            bail!("block size must be between 1 and {}", tftp::MAX_FRAME_PAYLOAD);
        }
        if self.timeout.is_zero() {
            bail!("timeout must be greater than zero");
        }
        Ok(())
    }
}

/// How packets are carried between the two ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One packet per UDP datagram.
    Datagram,
    /// Length-framed packets over a TCP connection.
    Stream,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Well-known endpoint requests are received on.
    pub bind: SocketAddr,

    /// Directory request filenames are resolved under.
    pub base_dir: PathBuf,

    pub framing: Framing,

    /// Upper bound on concurrently running sessions.
    pub max_sessions: usize,

    /// Ports session endpoints may be bound on. `None` lets the OS choose.
    pub port_range: Option<RangeInclusive<u16>>,

    /// How long a stream connection may sit idle between requests.
    pub idle_timeout: Duration,

    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: (Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            base_dir: PathBuf::from("."),
            framing: Framing::Datagram,
            max_sessions: 10,
            port_range: None,
            idle_timeout: Duration::from_secs(50),
            transfer: TransferConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        self.transfer.validate()?;
        if self.max_sessions == 0 {
            bail!("at least one concurrent session must be allowed");
        }
        if let Some(range) = &self.port_range {
            if range.is_empty() {
                bail!("port range {}-{} is empty", range.start(), range.end());
            }
        }
        if !self.base_dir.is_dir() {
            bail!("base directory {} is not a directory", self.base_dir.display());
        }
        Ok(())
    }
}

/// Parses `lo-hi` into an inclusive port range.
pub fn parse_port_range(raw: &str) -> Result<RangeInclusive<u16>> {
    let Some((lo, hi)) = raw.split_once('-') else {
        bail!("expected a range like 50000-50100, got '{raw}'");
    };
    let lo: u16 = lo.trim().parse()?;
    let hi: u16 = hi.trim().parse()?;
    if lo == 0 || lo > hi {
        bail!("invalid port range '{raw}'");
    }
    Ok(lo..=hi)
}
