// This module contains the server-side request handler.
//
// A handler is created for one read or write request once the dispatcher has accepted it. It works
// in two stages:
//
// 1. Check whether the request can be serviced by interacting with the filesystem. A request that
//    cannot be serviced is answered with a single Error packet and the handler finishes without
//    entering any retry loop.
// 2. Hand the opened file to the transfer engine: the sending role for read requests, the
//    receiving role (opened by Ack 0) for write requests.
//
// The handler is generic over its transport, so the same code serves a session socket bound for
// one datagram transfer and one request on a stream connection.

use crate::fsutil::{self, PartialFile};
use crate::processor::TransferSummary;
use crate::tftp::{Direction, ErrorCode, Packet, Request, TransferError};
use crate::transfer::TransferEngine;
use crate::transport::Transport;
use std::error;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{File, OpenOptions};

#[derive(Debug)]
pub enum SessionError {
    /// The request was refused before any data moved; `code` went back to the peer.
    Rejected { code: ErrorCode, message: String },

    /// The file could not be opened or created.
    File(io::Error),

    /// The transfer itself failed.
    Transfer(TransferError),
}

impl SessionError {
    fn rejected(code: ErrorCode, message: impl Into<String>) -> SessionError {
        SessionError::Rejected { code, message: message.into() }
    }

    /// The Error packet that tells the peer about this failure, if it should be told at all.
    /// Transfer failures are reported by the engine itself.
    pub fn reply(&self) -> Option<Packet> {
        match self {
            SessionError::Rejected { code, message } => {
                Some(Packet::Error { code: *code, message: message.clone() })
            }
            SessionError::File(e) => Some(Packet::Error { code: e.kind().into(), message: e.to_string() }),
            SessionError::Transfer(_) => None,
        }
    }
}

impl error::Error for SessionError {}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::Rejected { code, message } => write!(f, "Request refused with {code}: {message}"),
            SessionError::File(e) => write!(f, "File IO error: {e}"),
            SessionError::Transfer(e) => write!(f, "Transfer failed: {e}"),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> SessionError {
        SessionError::File(e)
    }
}

impl From<TransferError> for SessionError {
    fn from(e: TransferError) -> SessionError {
        SessionError::Transfer(e)
    }
}

/// Checks the parts of a request that don't need the filesystem.
pub fn validate_request(request: &Request) -> Result<(), SessionError> {
    if !request.is_octet() {
        return Err(SessionError::rejected(
            ErrorCode::IllegalOperation,
            format!("Unsupported transfer mode '{}', only octet is served", request.mode),
        ));
    }
    Ok(())
}

/// Resolves a requested filename under `base_dir`. A leading '/' is ignored; anything that would
/// climb out of `base_dir` is refused.
pub fn resolve_path(base_dir: &Path, filename: &str) -> Result<PathBuf, SessionError> {
    let relative = Path::new(filename.trim_start_matches('/'));
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.as_os_str().is_empty() {
        return Err(SessionError::rejected(
            ErrorCode::AccessViolation,
            format!("Illegal path '{filename}'"),
        ));
    }
    Ok(base_dir.join(relative))
}

/// An object responsible for handling a request.
pub struct ServerRequestHandler<T> {
    transport: T,
    request: Request,
    base_dir: PathBuf,
    engine: TransferEngine,
}

impl<T: Transport> ServerRequestHandler<T> {
    pub fn new(
        transport: T,
        request: Request,
        base_dir: &Path,
        engine: TransferEngine,
    ) -> ServerRequestHandler<T> {
        ServerRequestHandler { transport, request, base_dir: base_dir.to_path_buf(), engine }
    }

    /// Services the request until the transfer finishes, fails, or is refused.
    pub async fn handle(mut self) -> Result<TransferSummary, SessionError> {
        let outcome = match self.prepare() {
            Ok(path) => match self.request.direction {
                Direction::Read => self.serve_read(&path).await,
                Direction::Write => self.serve_write(&path).await,
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            if let Some(reply) = e.reply() {
                // Error packet is sent as a courtesy, we don't care how it goes.
                let _ = self.transport.send(&reply).await;
            }
        }
        outcome
    }

    fn prepare(&self) -> Result<PathBuf, SessionError> {
        validate_request(&self.request)?;
        resolve_path(&self.base_dir, &self.request.filename)
    }

    async fn serve_read(&mut self, path: &Path) -> Result<TransferSummary, SessionError> {
        if !fsutil::is_readable(path) {
            let code = if path.exists() { ErrorCode::AccessViolation } else { ErrorCode::FileNotFound };
            return Err(SessionError::rejected(code, code.default_message()));
        }

        let file = File::open(path).await?;
        log::info!("Sending {}", path.display());
        let summary = self.engine.send(&mut self.transport, file, None).await?;
        Ok(summary)
    }

    async fn serve_write(&mut self, path: &Path) -> Result<TransferSummary, SessionError> {
        if !fsutil::is_writable(path) {
            return Err(SessionError::rejected(
                ErrorCode::AccessViolation,
                ErrorCode::AccessViolation.default_message(),
            ));
        }
        if path.exists() {
            return Err(SessionError::rejected(
                ErrorCode::FileExists,
                ErrorCode::FileExists.default_message(),
            ));
        }

        let file = OpenOptions::new().write(true).create_new(true).open(path).await?;
        let partial = PartialFile::new(path);
        log::info!("Receiving {}", path.display());
        let summary = self.engine.receive(&mut self.transport, file, None).await?;
        partial.keep();
        Ok(summary)
    }
}
