// Client driver: one request, one transfer.
//
// The client sends a single request and then runs the receiving role (download) or the sending
// role (upload) over the same transport. Retries only ever happen per block inside the engine;
// a failed transfer is reported to the caller and never restarted.

use crate::config::{Framing, TransferConfig};
use crate::fsutil::PartialFile;
use crate::processor::TransferSummary;
use crate::tftp::{Direction, Request, TransferError, MODE_OCTET};
use crate::transfer::TransferEngine;
use crate::transport::{DatagramTransport, StreamTransport};
use async_io::Async;
use std::error;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::net::TcpStream;

#[derive(Debug)]
pub enum ClientError {
    /// The local file could not be opened or created.
    LocalFile(io::Error),

    /// Talking to the server failed.
    Transfer(TransferError),
}

impl error::Error for ClientError {}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientError::LocalFile(e) => write!(f, "Local file error: {e}"),
            ClientError::Transfer(e) => write!(f, "{e}"),
        }
    }
}

impl From<TransferError> for ClientError {
    fn from(e: TransferError) -> ClientError {
        ClientError::Transfer(e)
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    server: SocketAddr,
    framing: Framing,
    engine: TransferEngine,
}

impl Client {
    pub fn new(server: SocketAddr, framing: Framing, config: TransferConfig) -> Client {
        Client { server, framing, engine: TransferEngine::new(config) }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Fetches `remote` from the server into `local`. The download lands in a sibling file that
    /// replaces `local` only once it is complete, so a failed download leaves `local` as it was.
    pub async fn get(&self, remote: &str, local: &Path) -> Result<TransferSummary, ClientError> {
        let request = Request::new(Direction::Read, remote, MODE_OCTET)?;
        let staging = staging_path(local)?;
        let file = File::create(&staging).await.map_err(ClientError::LocalFile)?;
        let partial = PartialFile::new(&staging);

        log::info!("Downloading {remote} from {} to {}", self.server, local.display());
        let summary = match self.framing {
            Framing::Datagram => {
                let mut transport = self.datagram_transport()?;
                self.engine.receive(&mut transport, file, Some(request)).await?
            }
            Framing::Stream => {
                let mut transport = self.stream_transport().await?;
                self.engine.receive(&mut transport, file, Some(request)).await?
            }
        };
        fs::rename(&staging, local).await.map_err(ClientError::LocalFile)?;
        partial.keep();
        Ok(summary)
    }

    /// Sends `local` to the server, stored as `remote`.
    pub async fn put(&self, local: &Path, remote: &str) -> Result<TransferSummary, ClientError> {
        let request = Request::new(Direction::Write, remote, MODE_OCTET)?;
        let file = File::open(local).await.map_err(ClientError::LocalFile)?;

        log::info!("Uploading {} to {} as {remote}", local.display(), self.server);
        let summary = match self.framing {
            Framing::Datagram => {
                let mut transport = self.datagram_transport()?;
                self.engine.send(&mut transport, file, Some(request)).await?
            }
            Framing::Stream => {
                let mut transport = self.stream_transport().await?;
                self.engine.send(&mut transport, file, Some(request)).await?
            }
        };
        Ok(summary)
    }

    fn datagram_transport(&self) -> Result<DatagramTransport, TransferError> {
        let local: SocketAddr = match self.server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let sock = Async::<UdpSocket>::bind(local)?;
        Ok(DatagramTransport::connecting(sock, self.server))
    }

    async fn stream_transport(&self) -> Result<StreamTransport<TcpStream>, TransferError> {
        let stream = TcpStream::connect(self.server).await?;
        Ok(StreamTransport::new(stream))
    }
}

/// Hidden file next to `local` that a download is written to.
fn staging_path(local: &Path) -> Result<PathBuf, ClientError> {
    let name = local.file_name().ok_or_else(|| {
        ClientError::LocalFile(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} doesn't name a file", local.display()),
        ))
    })?;
    let mut staged = OsString::from(".");
    staged.push(name);
    staged.push(".part");
    Ok(local.with_file_name(staged))
}
