// Stop-and-wait driver shared by client and server.
//
// The engine sends the processor's outstanding packet, then waits for the peer. Every packet that
// arrives is handed to the processor; a timeout retransmits the outstanding packet. Each packet
// that makes progress resets the retry budget, so the budget bounds consecutive failures on a
// single block rather than the whole transfer.

use crate::config::TransferConfig;
use crate::processor::{Processor, RecvProcessor, ResultAction, SendProcessor, TransferSummary};
use crate::tftp::{ErrorCode, Packet, Request, TftpResult, TransferError};
use crate::transport::Transport;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TransferEngine {
    config: TransferConfig,

    /// Flips to `true` when the owner wants in-flight transfers to stop.
    shutdown: Option<watch::Receiver<bool>>,
}

impl TransferEngine {
    pub fn new(config: TransferConfig) -> TransferEngine {
        TransferEngine { config, shutdown: None }
    }

    /// Makes transfers run by this engine give up as soon as `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> TransferEngine {
        self.shutdown = Some(shutdown);
        self
    }

    /// Sends `source` to the peer. With a `request` (an upload) the request is sent first and
    /// data starts once the peer acknowledges block 0.
    pub async fn send<T, R>(
        &self,
        transport: &mut T,
        source: R,
        request: Option<Request>,
    ) -> TftpResult<TransferSummary>
    where
        T: Transport,
        R: AsyncRead + Unpin,
    {
        let block_size = self.config.block_size;
        let mut processor = match request {
            Some(request) => SendProcessor::with_request(source, block_size, request),
            None => SendProcessor::new(source, block_size),
        };
        self.run(transport, &mut processor).await
    }

    /// Receives the peer's file into `sink`. With a `request` (a download) the request opens the
    /// transfer, otherwise an acknowledgement of block 0 does.
    ///
    /// Out-of-sequence Data only counts against the retry budget when serving a write request; a
    /// downloading client is bounded by its timeout alone.
    pub async fn receive<T, W>(
        &self,
        transport: &mut T,
        sink: W,
        request: Option<Request>,
    ) -> TftpResult<TransferSummary>
    where
        T: Transport,
        W: AsyncWrite + Unpin,
    {
        let block_size = self.config.block_size;
        let bound_resync = request.is_none();
        let mut processor = match request {
            Some(request) => RecvProcessor::with_request(sink, block_size, request),
            None => RecvProcessor::new(sink, block_size),
        };
        self.drive(transport, &mut processor, bound_resync).await
    }

    /// Does the work of sending and receiving packets until the transfer finishes or fails.
    pub async fn run<T, P>(&self, transport: &mut T, processor: &mut P) -> TftpResult<TransferSummary>
    where
        T: Transport,
        P: Processor,
    {
        self.drive(transport, processor, true).await
    }

    async fn drive<T, P>(
        &self,
        transport: &mut T,
        processor: &mut P,
        bound_resync: bool,
    ) -> TftpResult<TransferSummary>
    where
        T: Transport,
        P: Processor,
    {
        let mut shutdown = self.shutdown.clone();
        let mut out_packet = match processor.first_packet().await {
            ResultAction::SendPacketAndAwait(p) => p,
            ResultAction::Abort { reply, error } => {
                courtesy(transport, reply).await;
                return Err(error);
            }
            other => {
                return Err(TransferError::ProtocolViolation(format!(
                    "Transfer cannot open with {other:?}"
                )))
            }
        };

        let mut retries: u32 = 0;
        let mut resend = true;

        // This loop is used for message sending as well as retries, depending on whether
        // `out_packet` has been overwritten.
        loop {
            if is_stopping(&shutdown) {
                return Err(TransferError::Cancelled);
            }
            if resend {
                transport.send(&out_packet).await?;
            }

            let deadline = Instant::now() + self.config.timeout;
            let timed_out = loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let received = tokio::select! {
                    r = transport.recv_with_timeout(remaining) => r,
                    _ = stop_requested(&mut shutdown) => return Err(TransferError::Cancelled),
                };

                let packet = match received {
                    Ok(packet) => packet,
                    Err(TransferError::RecvTimeout) => break true,
                    // If we couldn't parse the incoming packet, tell the peer and give up.
                    Err(TransferError::MalformedPacket(msg)) => {
                        let reply = Packet::Error {
                            code: ErrorCode::IllegalOperation,
                            message: format!("Error parsing incoming packet: {msg}"),
                        };
                        courtesy(transport, Some(reply)).await;
                        return Err(TransferError::MalformedPacket(msg));
                    }
                    Err(e) => return Err(e),
                };

                match processor.process_packet(&packet).await {
                    ResultAction::SendPacketAndAwait(p) => {
                        out_packet = p;
                        break false;
                    }
                    ResultAction::Resync(p) => {
                        if bound_resync {
                            retries += 1;
                        }
                        if retries > self.config.max_retries {
                            let message = format!(
                                "Gave up on block {} after {retries} out-of-sequence packets",
                                processor.current_block()
                            );
                            let reply = Packet::Error { code: ErrorCode::IllegalOperation, message: message.clone() };
                            courtesy(transport, Some(reply)).await;
                            return Err(TransferError::ProtocolViolation(message));
                        }
                        transport.send(&p).await?;
                    }
                    ResultAction::RetryRecv => continue,
                    ResultAction::Complete => return Ok(processor.summary()),
                    ResultAction::TerminateWithPacket(p) => {
                        transport.send(&p).await?;
                        return Ok(processor.summary());
                    }
                    ResultAction::Abort { reply, error } => {
                        courtesy(transport, reply).await;
                        return Err(error);
                    }
                }
            };

            if !timed_out {
                retries = 0;
                resend = true;
                continue;
            }

            retries += 1;
            if retries > self.config.max_retries {
                let reply = Packet::Error {
                    code: ErrorCode::Undefined,
                    message: "Transfer timed out".to_string(),
                };
                courtesy(transport, Some(reply)).await;
                return Err(TransferError::TransferTimeout { block: processor.current_block(), attempts: retries });
            }
            // Stream transports never lose a packet, so a timeout there only means a slow peer.
            resend = !transport.is_reliable();
            log::info!(
                "Timed out waiting on block {}, retrying ({retries}/{})",
                processor.current_block(),
                self.config.max_retries
            );
        }
    }
}

/// Error packets are sent as a courtesy, we don't care how it goes.
async fn courtesy<T: Transport>(transport: &mut T, reply: Option<Packet>) {
    if let Some(packet) = reply {
        if let Err(e) = transport.send(&packet).await {
            log::debug!("Couldn't deliver {:?} packet: {e}", packet.opcode());
        }
    }
}

fn is_stopping(shutdown: &Option<watch::Receiver<bool>>) -> bool {
    shutdown.as_ref().map_or(false, |rx| *rx.borrow())
}

/// Resolves once a stop is requested; never resolves without a shutdown channel or once its
/// sender is gone.
async fn stop_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        if rx.wait_for(|stop| *stop).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::{Direction, TftpResult};
    use crate::transport::StreamTransport;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    /// Replays a script of receive results and records everything sent.
    struct ScriptedTransport {
        incoming: VecDeque<TftpResult<Packet>>,
        sent: Vec<Packet>,
    }

    impl ScriptedTransport {
        fn new(incoming: Vec<TftpResult<Packet>>) -> ScriptedTransport {
            ScriptedTransport { incoming: incoming.into(), sent: Vec::new() }
        }

        fn data_blocks(&self) -> Vec<(u16, usize)> {
            self.sent
                .iter()
                .filter_map(|p| match p {
                    Packet::Data { block, data } => Some((*block, data.len())),
                    _ => None,
                })
                .collect()
        }
    }

    impl Transport for ScriptedTransport {
        async fn send(&mut self, packet: &Packet) -> TftpResult<()> {
            self.sent.push(packet.clone());
            Ok(())
        }

        async fn recv_with_timeout(&mut self, _ttl: Duration) -> TftpResult<Packet> {
            self.incoming.pop_front().unwrap_or(Err(TransferError::RecvTimeout))
        }
    }

    fn ack(block: u16) -> TftpResult<Packet> {
        Ok(Packet::Ack { block })
    }

    fn data(block: u16, len: usize) -> TftpResult<Packet> {
        Ok(Packet::Data { block, data: vec![0x42; len] })
    }

    fn engine(max_retries: u32) -> TransferEngine {
        TransferEngine::new(TransferConfig {
            max_retries,
            timeout: Duration::from_millis(10),
            ..TransferConfig::default()
        })
    }

    #[tokio::test]
    async fn test_block_count_matches_file_size() {
        for (size, expected) in [(0, vec![0]), (1000, vec![512, 488]), (1024, vec![512, 512, 0])] {
            let acks = (1..=expected.len() as u16).map(ack).collect();
            let mut transport = ScriptedTransport::new(acks);

            let summary = engine(3).send(&mut transport, Cursor::new(vec![1_u8; size]), None).await.unwrap();

            let lens: Vec<usize> = transport.data_blocks().into_iter().map(|(_, len)| len).collect();
            assert_eq!(lens, expected);
            assert_eq!(summary.bytes, size as u64);
            assert_eq!(summary.blocks as usize, expected.len());
        }
    }

    #[tokio::test]
    async fn test_timeout_retransmits_same_block_then_fails() {
        let mut transport = ScriptedTransport::new(vec![ack(1)]);

        let result = engine(3).send(&mut transport, Cursor::new(vec![7_u8; 700]), None).await;

        match result {
            Err(TransferError::TransferTimeout { block, attempts }) => {
                assert_eq!(block, 2);
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected result {other:?}"),
        }
        // Block 1 once, then block 2 and its three retransmissions.
        assert_eq!(transport.data_blocks(), vec![(1, 512), (2, 188), (2, 188), (2, 188), (2, 188)]);
        assert_eq!(
            transport.sent.last(),
            Some(&Packet::Error { code: ErrorCode::Undefined, message: "Transfer timed out".to_string() })
        );
    }

    #[tokio::test]
    async fn test_recovers_after_lost_ack() {
        let script = vec![Err(TransferError::RecvTimeout), ack(1), Err(TransferError::RecvTimeout), ack(2)];
        let mut transport = ScriptedTransport::new(script);

        let summary = engine(1).send(&mut transport, Cursor::new(vec![3_u8; 600]), None).await.unwrap();

        assert_eq!(summary.blocks, 2);
        assert_eq!(transport.data_blocks(), vec![(1, 512), (1, 512), (2, 88), (2, 88)]);
    }

    #[tokio::test]
    async fn test_duplicate_ack_sends_nothing() {
        let mut transport = ScriptedTransport::new(vec![ack(1), ack(1), ack(1), ack(2)]);

        engine(0).send(&mut transport, Cursor::new(vec![3_u8; 600]), None).await.unwrap();

        assert_eq!(transport.data_blocks(), vec![(1, 512), (2, 88)]);
    }

    #[tokio::test]
    async fn test_peer_error_aborts_without_reply() {
        let peer = Packet::Error { code: ErrorCode::DiskFull, message: "full".to_string() };
        let mut transport = ScriptedTransport::new(vec![Ok(peer)]);

        let result = engine(3).send(&mut transport, Cursor::new(vec![0_u8; 10]), None).await;

        assert!(matches!(
            result,
            Err(TransferError::PeerError { code: ErrorCode::DiskFull, .. })
        ));
        assert_eq!(transport.sent.len(), 1);
    }

    #[tokio::test]
    async fn test_receive_in_order() {
        let mut transport = ScriptedTransport::new(vec![data(1, 512), data(2, 488)]);
        let mut sink = Vec::new();

        let summary = engine(3).receive(&mut transport, &mut sink, None).await.unwrap();

        assert_eq!(summary, TransferSummary { bytes: 1000, blocks: 2 });
        assert_eq!(sink.len(), 1000);
        assert_eq!(
            transport.sent,
            vec![Packet::Ack { block: 0 }, Packet::Ack { block: 1 }, Packet::Ack { block: 2 }]
        );
    }

    #[tokio::test]
    async fn test_receive_timeout_resends_last_ack() {
        let script = vec![data(1, 512), Err(TransferError::RecvTimeout), data(2, 0)];
        let mut transport = ScriptedTransport::new(script);
        let mut sink = Vec::new();

        engine(2).receive(&mut transport, &mut sink, None).await.unwrap();

        assert_eq!(
            transport.sent,
            vec![
                Packet::Ack { block: 0 },
                Packet::Ack { block: 1 },
                Packet::Ack { block: 1 },
                Packet::Ack { block: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn test_receive_duplicate_data_is_reacked_not_written() {
        let script = vec![data(1, 512), data(1, 512), data(2, 5)];
        let mut transport = ScriptedTransport::new(script);
        let mut sink = Vec::new();

        let summary = engine(2).receive(&mut transport, &mut sink, None).await.unwrap();

        assert_eq!(summary.bytes, 517);
        assert_eq!(sink.len(), 517);
        assert_eq!(
            transport.sent,
            vec![
                Packet::Ack { block: 0 },
                Packet::Ack { block: 1 },
                Packet::Ack { block: 1 },
                Packet::Ack { block: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn test_receive_gives_up_on_endless_duplicates() {
        let script = vec![data(1, 512), data(1, 512), data(1, 512), data(1, 512)];
        let mut transport = ScriptedTransport::new(script);

        let result = engine(2).receive(&mut transport, Vec::new(), None).await;

        assert!(matches!(result, Err(TransferError::ProtocolViolation(_))));
        assert!(matches!(transport.sent.last(), Some(Packet::Error { code: ErrorCode::IllegalOperation, .. })));
    }

    #[tokio::test]
    async fn test_download_retransmits_request_until_first_block() {
        let request = Request::new(Direction::Read, "f.bin", "octet").unwrap();
        let script = vec![Err(TransferError::RecvTimeout), data(1, 3)];
        let mut transport = ScriptedTransport::new(script);

        engine(1).receive(&mut transport, Vec::new(), Some(request.clone())).await.unwrap();

        assert_eq!(
            transport.sent,
            vec![Packet::Request(request.clone()), Packet::Request(request), Packet::Ack { block: 1 }]
        );
    }

    #[tokio::test]
    async fn test_malformed_packet_is_reported_to_peer() {
        let script = vec![Err(TransferError::MalformedPacket("Unknown opcode: 9".to_string()))];
        let mut transport = ScriptedTransport::new(script);

        let result = engine(3).receive(&mut transport, Vec::new(), None).await;

        assert!(matches!(result, Err(TransferError::MalformedPacket(_))));
        assert_eq!(
            transport.sent.last(),
            Some(&Packet::Error {
                code: ErrorCode::IllegalOperation,
                message: "Error parsing incoming packet: Unknown opcode: 9".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_download_tolerates_duplicates_beyond_retry_budget() {
        let request = Request::new(Direction::Read, "f.bin", "octet").unwrap();
        let mut script = vec![data(1, 512)];
        script.extend((0..6).map(|_| data(1, 512)));
        script.push(data(2, 10));
        let mut transport = ScriptedTransport::new(script);

        let summary = engine(2).receive(&mut transport, Vec::new(), Some(request)).await.unwrap();

        assert_eq!(summary, TransferSummary { bytes: 522, blocks: 2 });
        let reacks = transport.sent.iter().filter(|p| **p == Packet::Ack { block: 1 }).count();
        assert_eq!(reacks, 7);
        assert_eq!(transport.sent.last(), Some(&Packet::Ack { block: 2 }));
    }

    #[tokio::test]
    async fn test_stream_timeout_waits_without_resending() {
        let (ours, mut theirs) = tokio::io::duplex(8192);
        let mut transport = StreamTransport::new(ours);

        let result = engine(2).send(&mut transport, Cursor::new(vec![4_u8; 600]), None).await;

        match result {
            Err(TransferError::TransferTimeout { block, attempts }) => {
                assert_eq!(block, 1);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result {other:?}"),
        }
        drop(transport);

        let mut bytes = Vec::new();
        theirs.read_to_end(&mut bytes).await.unwrap();
        let mut frames = Vec::new();
        let mut rest = &bytes[..];
        while let Some((packet, used)) = Packet::parse_stream_frame(rest).unwrap() {
            frames.push(packet);
            rest = &rest[used..];
        }
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Packet::Data { block: 1, .. }));
        assert_eq!(
            frames[1],
            Packet::Error { code: ErrorCode::Undefined, message: "Transfer timed out".to_string() }
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels_transfer() {
        let (tx, rx) = watch::channel(false);
        let engine = engine(3).with_shutdown(rx);
        tx.send(true).unwrap();

        let mut transport = ScriptedTransport::new(vec![ack(1)]);
        let result = engine.send(&mut transport, Cursor::new(vec![0_u8; 600]), None).await;

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(transport.sent.is_empty());
    }
}
