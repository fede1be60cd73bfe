// ============================================
// File: crates/wrapguard-shim/src/channel.rs
// ============================================
//! # Control Channel Client
//!
//! ## Creation Reason
//! The shim's side of the request/response channel to the supervisor:
//! one lazily-opened Unix socket per process, one request in flight at
//! a time.
//!
//! ## Main Functionality
//! - Lazy connect to `WRAPGUARD_IPC_PATH` on first use
//! - `request`: write one record line, read one response line
//! - On transport failure the socket is discarded so the next request
//!   reconnects
//!
//! ## Ordering
//! Requests from every thread of the child serialize through the
//! channel mutex; holding it across the round-trip is what preserves
//! response ordering on the single socket. The descriptor table has its
//! own lock and is never held here.
//!
//! ## Last Modified
//! v0.1.0 - Initial channel client

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use wrapguard_common::protocol::{Request, Response};

use crate::state;

// ============================================
// Errors
// ============================================

/// Why a round-trip failed.
#[derive(Debug)]
pub enum ChannelError {
    /// No control channel is configured or reachable.
    Unavailable,
    /// The channel broke mid-conversation.
    Transport,
    /// The supervisor answered with something unparseable.
    Protocol,
}

// ============================================
// Channel
// ============================================

struct Channel {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Channel {
    fn connect() -> Result<Self, ChannelError> {
        let path = state::config()
            .ipc_path
            .as_ref()
            .ok_or(ChannelError::Unavailable)?;
        let stream = UnixStream::connect(path).map_err(|_| ChannelError::Unavailable)?;
        let reader = BufReader::new(stream.try_clone().map_err(|_| ChannelError::Unavailable)?);
        Ok(Self {
            reader,
            writer: stream,
        })
    }

    fn roundtrip(&mut self, request: &Request) -> Result<Response, ChannelError> {
        let mut line = request.to_line();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .map_err(|_| ChannelError::Transport)?;

        let mut reply = String::new();
        let n = self
            .reader
            .read_line(&mut reply)
            .map_err(|_| ChannelError::Transport)?;
        if n == 0 {
            return Err(ChannelError::Transport);
        }
        Response::from_line(&reply).map_err(|_| ChannelError::Protocol)
    }
}

static CHANNEL: Lazy<Mutex<Option<Channel>>> = Lazy::new(|| Mutex::new(None));

/// Sends one request and waits for its response.
pub fn request(request: &Request) -> Result<Response, ChannelError> {
    let mut guard = CHANNEL.lock();
    if guard.is_none() {
        *guard = Some(Channel::connect()?);
    }
    let channel = guard.as_mut().ok_or(ChannelError::Unavailable)?;

    match channel.roundtrip(request) {
        Ok(response) => Ok(response),
        Err(e) => {
            // Reconnect on the next call rather than wedging forever.
            *guard = None;
            state::debug_log(|| format!("control channel failed: {e:?}"));
            Err(e)
        }
    }
}
