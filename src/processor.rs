// Per-block state machines for the two roles of a transfer.
//
// A processor never touches the network. It is handed each packet the peer sends and answers with
// a ResultAction describing what the caller should do next; the transfer engine owns the transport,
// the timers and the retry budget. The sending role reads the source in block-sized chunks and
// waits for the matching acknowledgement of each one, the receiving role writes each expected
// block to the sink and acknowledges it.

use crate::tftp::{ErrorCode, Packet, Request, TransferError};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// What a finished transfer moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Payload bytes carried by Data packets.
    pub bytes: u64,

    /// Number of Data packets, including a trailing empty one.
    pub blocks: u32,
}

/// Represents an action that the caller of a processor should take in
/// response to processing a packet.
#[derive(Debug)]
pub enum ResultAction {
    /// Caller should send the packet and await a response. The packet replaces whatever was
    /// outstanding, so it is also what gets retransmitted on timeout.
    SendPacketAndAwait(Packet),

    /// Caller should send the packet to put the peer back in step, then keep waiting for the
    /// packet it was already waiting for.
    Resync(Packet),

    /// Caller should try receiving again.
    RetryRecv,

    /// The transfer is done and nothing more needs sending.
    Complete,

    /// Caller should finish the transfer successfully by sending the packet.
    TerminateWithPacket(Packet),

    /// The transfer failed. `reply` goes to the peer as a courtesy if present.
    Abort { reply: Option<Packet>, error: TransferError },
}

/// A role in a transfer.
#[allow(async_fn_in_trait)]
pub trait Processor {
    /// What to send before anything has been received.
    async fn first_packet(&mut self) -> ResultAction;

    /// Given an incoming packet, processes it and describes the action the caller should take.
    async fn process_packet(&mut self, packet: &Packet) -> ResultAction;

    /// Block the processor is currently trying to get across.
    fn current_block(&self) -> u16;

    fn summary(&self) -> TransferSummary;
}

fn peer_error(code: ErrorCode, message: &str) -> ResultAction {
    log::warn!("Peer sent error packet: code: {code}, message: '{message}'");
    ResultAction::Abort {
        reply: None,
        error: TransferError::PeerError { code, message: message.to_string() },
    }
}

fn illegal(message: String) -> ResultAction {
    ResultAction::Abort {
        reply: Some(Packet::Error { code: ErrorCode::IllegalOperation, message: message.clone() }),
        error: TransferError::ProtocolViolation(message),
    }
}

fn io_failure(context: &str, e: io::Error) -> ResultAction {
    ResultAction::Abort {
        reply: Some(Packet::Error { code: e.kind().into(), message: format!("{context}: {e}") }),
        error: TransferError::Io(e),
    }
}

/// Sending role: server side of a read request, client side of an upload.
#[derive(Debug)]
pub struct SendProcessor<R> {
    source: R,
    block_size: usize,

    /// Write request still to be sent, for uploads.
    request: Option<Packet>,

    curr_block: u16,
    awaiting_final_ack: bool,
    summary: TransferSummary,
}

impl<R: AsyncRead + Unpin> SendProcessor<R> {
    /// Serves a read request: block 1 goes out straight away.
    pub fn new(source: R, block_size: usize) -> SendProcessor<R> {
        SendProcessor {
            source,
            block_size,
            request: None,
            curr_block: 0,
            awaiting_final_ack: false,
            summary: TransferSummary::default(),
        }
    }

    /// Uploads: the write request goes out first and Data starts once the server acknowledges
    /// block 0.
    pub fn with_request(source: R, block_size: usize, request: Request) -> SendProcessor<R> {
        SendProcessor { request: Some(Packet::Request(request)), ..SendProcessor::new(source, block_size) }
    }

    async fn next_block(&mut self) -> ResultAction {
        match read_block(&mut self.source, self.block_size).await {
            Ok(data) => {
                // Wraps after 65535 blocks; files that large are not supported.
                self.curr_block = self.curr_block.wrapping_add(1);
                if data.len() < self.block_size {
                    self.awaiting_final_ack = true;
                }
                self.summary.bytes += data.len() as u64;
                self.summary.blocks += 1;
                ResultAction::SendPacketAndAwait(Packet::Data { block: self.curr_block, data })
            }
            Err(e) => io_failure("Failed to read from file", e),
        }
    }

    async fn process_ack(&mut self, packet: &Packet) -> ResultAction {
        match packet {
            &Packet::Ack { block } if block == self.curr_block => {
                if self.awaiting_final_ack {
                    return ResultAction::Complete;
                }
                self.next_block().await
            }
            &Packet::Ack { block } => {
                log::warn!(
                    "Received ack for block {block} while waiting for block {}",
                    self.curr_block
                );
                ResultAction::RetryRecv
            }
            Packet::Error { code, message } => peer_error(*code, message),
            other => illegal(format!(
                "Expected to receive an Ack packet, but got {:?} instead",
                other.opcode()
            )),
        }
    }
}

impl<R: AsyncRead + Unpin> Processor for SendProcessor<R> {
    async fn first_packet(&mut self) -> ResultAction {
        match self.request.take() {
            Some(request) => ResultAction::SendPacketAndAwait(request),
            None => self.next_block().await,
        }
    }

    async fn process_packet(&mut self, packet: &Packet) -> ResultAction {
        self.process_ack(packet).await
    }

    fn current_block(&self) -> u16 {
        self.curr_block
    }

    fn summary(&self) -> TransferSummary {
        self.summary
    }
}

/// Reads up to `block_size` bytes. Only a short result (possibly empty) means end of file.
async fn read_block<R: AsyncRead + Unpin>(f: &mut R, block_size: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; block_size];
    let mut cursor = 0;

    // A single read may return less than was asked for without being at end of file, so keep
    // filling the rest of the buffer until it is full or the source is exhausted.
    while cursor < buf.len() {
        let s = f.read(&mut buf[cursor..]).await?;
        if s == 0 {
            break;
        }
        cursor += s;
    }
    buf.truncate(cursor);
    Ok(buf)
}

/// Receiving role: server side of a write request, client side of a download.
#[derive(Debug)]
pub struct RecvProcessor<W> {
    sink: W,
    block_size: usize,

    /// Read request still to be sent, for downloads.
    request: Option<Packet>,

    /// Last block written and acknowledged.
    curr_block: u16,
    summary: TransferSummary,
}

impl<W: AsyncWrite + Unpin> RecvProcessor<W> {
    /// Serves a write request: acknowledging block 0 tells the client to start.
    pub fn new(sink: W, block_size: usize) -> RecvProcessor<W> {
        RecvProcessor {
            sink,
            block_size,
            request: None,
            curr_block: 0,
            summary: TransferSummary::default(),
        }
    }

    /// Downloads: the read request is what gets (re)sent until block 1 arrives.
    pub fn with_request(sink: W, block_size: usize, request: Request) -> RecvProcessor<W> {
        RecvProcessor { request: Some(Packet::Request(request)), ..RecvProcessor::new(sink, block_size) }
    }

    async fn process_data(&mut self, packet: &Packet) -> ResultAction {
        match packet {
            Packet::Data { block, data } if *block == self.curr_block.wrapping_add(1) => {
                if data.len() > self.block_size {
                    return illegal(format!(
                        "Data block {block} carries {} bytes, more than the block size of {}",
                        data.len(),
                        self.block_size
                    ));
                }
                if let Err(e) = self.sink.write_all(data).await {
                    return io_failure("Error writing to file", e);
                }

                self.curr_block = *block;
                self.summary.bytes += data.len() as u64;
                self.summary.blocks += 1;
                let ack = Packet::Ack { block: self.curr_block };

                if data.len() < self.block_size {
                    if let Err(e) = self.sink.flush().await {
                        return io_failure("Error writing to file", e);
                    }
                    ResultAction::TerminateWithPacket(ack)
                } else {
                    ResultAction::SendPacketAndAwait(ack)
                }
            }
            Packet::Data { block, .. } => {
                log::warn!(
                    "Received data block {block} while expecting block {}, re-acknowledging {}",
                    self.curr_block.wrapping_add(1),
                    self.curr_block
                );
                ResultAction::Resync(Packet::Ack { block: self.curr_block })
            }
            Packet::Error { code, message } => peer_error(*code, message),
            other => illegal(format!(
                "Expected to receive a Data packet, but got {:?} instead",
                other.opcode()
            )),
        }
    }
}

impl<W: AsyncWrite + Unpin> Processor for RecvProcessor<W> {
    async fn first_packet(&mut self) -> ResultAction {
        let first = self.request.take().unwrap_or(Packet::Ack { block: 0 });
        ResultAction::SendPacketAndAwait(first)
    }

    async fn process_packet(&mut self, packet: &Packet) -> ResultAction {
        self.process_data(packet).await
    }

    fn current_block(&self) -> u16 {
        self.curr_block.wrapping_add(1)
    }

    fn summary(&self) -> TransferSummary {
        self.summary
    }
}
