// Packet transports the transfer engine runs over.
//
// A transport sends one packet at a time and receives one packet at a time with a bound on how
// long the receive may block. The datagram transport additionally enforces the transfer
// identifier: once its peer is known, datagrams from any other (address, port) are answered with
// an Unknown TID error and otherwise ignored, without disturbing the transfer.

use crate::tftp::{self, ErrorCode, Packet, TftpResult, TransferError};
use async_io::Async;
use rand::Rng;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

/// Attempts made to find a free port inside a configured range.
const BIND_ATTEMPTS: usize = 16;

/// Something packets can be exchanged over.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn send(&mut self, packet: &Packet) -> TftpResult<()>;

    /// Waits at most `ttl` for the next packet from the peer.
    async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<Packet>;

    /// Whether sent packets are guaranteed to arrive, making retransmission pointless.
    fn is_reliable(&self) -> bool {
        false
    }
}

impl<T: Transport> Transport for &mut T {
    async fn send(&mut self, packet: &Packet) -> TftpResult<()> {
        (**self).send(packet).await
    }

    async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<Packet> {
        (**self).recv_with_timeout(ttl).await
    }

    fn is_reliable(&self) -> bool {
        (**self).is_reliable()
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket bound to a single transfer.
pub struct DatagramTransport {
    sock: Async<UdpSocket>,

    /// Where packets are sent. Once `locked`, the only accepted source.
    peer: SocketAddr,

    locked: bool,

    buf: Vec<u8>,
}

impl DatagramTransport {
    /// A transport whose peer is already known, as on the server.
    pub fn with_peer(sock: Async<UdpSocket>, peer: SocketAddr) -> DatagramTransport {
        DatagramTransport { sock, peer, locked: true, buf: vec![0; tftp::MAX_DATAGRAM_SIZE] }
    }

    /// A client-side transport addressed at the server's well-known port. The first packet coming
    /// back from the server's host fixes the peer to whatever port the server answered from.
    pub fn connecting(sock: Async<UdpSocket>, server: SocketAddr) -> DatagramTransport {
        DatagramTransport { sock, peer: server, locked: false, buf: vec![0; tftp::MAX_DATAGRAM_SIZE] }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    fn check_source(&mut self, src: SocketAddr) -> TftpResult<()> {
        if self.locked {
            if src != self.peer {
                return Err(TransferError::UnknownPeer(src));
            }
        } else if src.ip() == self.peer.ip() {
            log::debug!("Peer answered from {src}, locking transfer to it");
            self.peer = src;
            self.locked = true;
        } else {
            return Err(TransferError::UnknownPeer(src));
        }
        Ok(())
    }

    async fn reject(&self, src: SocketAddr) {
        log::warn!("Dropping packet from {src}, this transfer belongs to {}", self.peer);
        // Courtesy only, the transfer carries on whatever happens.
        let packet = Packet::error(ErrorCode::UnknownTransactionId);
        if let Err(e) = self.sock.send_to(&packet.to_bytes(), src).await {
            log::debug!("Couldn't send Unknown TID error to {src}: {e}");
        }
    }
}

impl Transport for DatagramTransport {
    async fn send(&mut self, packet: &Packet) -> TftpResult<()> {
        self.sock.send_to(&packet.to_bytes(), self.peer).await?;
        Ok(())
    }

    async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<Packet> {
        let deadline = Instant::now() + ttl;
        loop {
            let (len, src) = timeout_at(deadline, self.sock.recv_from(&mut self.buf))
                .await
                .map_err(|_| TransferError::RecvTimeout)??;

            match self.check_source(src) {
                Ok(()) => return Packet::parse_from_buf(&self.buf[..len]),
                Err(TransferError::UnknownPeer(src)) => self.reject(src).await,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Binds a UDP socket for one session. With a port range, random ports from it are tried first;
/// otherwise (or when the range is exhausted) the OS picks the port.
pub fn bind_session_socket(
    ip: IpAddr,
    port_range: Option<&RangeInclusive<u16>>,
) -> TftpResult<Async<UdpSocket>> {
    if let Some(range) = port_range {
        let mut rng = rand::thread_rng();
        for _ in 0..BIND_ATTEMPTS {
            let port = rng.gen_range(range.clone());
            match Async::<UdpSocket>::bind((ip, port)) {
                Ok(sock) => return Ok(sock),
                Err(e) => log::warn!("Couldn't bind session socket on port {port}: {e}"),
            }
        }
        log::warn!(
            "No free port in {}-{}, letting the OS choose",
            range.start(),
            range.end()
        );
    }
    Ok(Async::<UdpSocket>::bind((ip, 0))?)
}

///////////////////////////////////////////////////////////////
/// Length-framed packets over a byte stream.
///
/// Incoming bytes are buffered until a whole frame is present, so a receive that times out in the
/// middle of a frame loses nothing and the next receive picks up where it stopped.
pub struct StreamTransport<S> {
    io: S,
    buf: Vec<u8>,
}

impl<S> StreamTransport<S> {
    pub fn new(io: S) -> StreamTransport<S> {
        StreamTransport { io, buf: Vec::new() }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport for StreamTransport<S> {
    async fn send(&mut self, packet: &Packet) -> TftpResult<()> {
        self.io.write_all(&packet.to_stream_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<Packet> {
        let deadline = Instant::now() + ttl;
        let mut chunk = [0_u8; 4096];
        loop {
            if let Some((packet, used)) = Packet::parse_stream_frame(&self.buf)? {
                self.buf.drain(..used);
                return Ok(packet);
            }

            let read = timeout_at(deadline, self.io.read(&mut chunk))
                .await
                .map_err(|_| TransferError::RecvTimeout)??;
            if read == 0 {
                if self.buf.is_empty() {
                    return Err(TransferError::Disconnected);
                }
                return Err(TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed in the middle of a frame",
                )));
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    fn is_reliable(&self) -> bool {
        true
    }
}
