//! ADB host protocol framing.
//!
//! Requests and framed replies are a 4 character hex length followed by that
//! many payload bytes. Status replies are a bare 4 byte `OKAY` or `FAIL`.
//! Shell replies are not framed at all and run until the daemon closes the
//! connection.
//!
//! [`FrameBuffer`] accumulates socket reads and hands out complete units,
//! keeping leftover bytes for the next call so pipelined replies (the device
//! tracking stream, a status immediately followed by its payload) work.

use bytes::{Bytes, BytesMut};

use crate::adb::AdbError;

/// Size of the hex length prefix and of a status reply
pub const HEADER_LEN: usize = 4;

/// Largest payload a 4 hex digit prefix can describe
pub const MAX_PAYLOAD_LEN: usize = 0xFFFF;

pub const OKAY: &[u8; 4] = b"OKAY";
pub const FAIL: &[u8; 4] = b"FAIL";

/// Encode a host request as `<len:04X><command>`
pub fn encode_request(command: &str) -> Result<Vec<u8>, AdbError> {
    let len = command.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(AdbError::CommandTooLong(len));
    }

    Ok(format!("{:04X}{}", len, command).into_bytes())
}

/// Parse a 4 character hex length prefix; either letter case is accepted
pub fn parse_length(header: &[u8]) -> Result<usize, AdbError> {
    if header.len() != HEADER_LEN || !header.iter().all(u8::is_ascii_hexdigit) {
        return Err(AdbError::Protocol(format!(
            "invalid length prefix {:?}",
            String::from_utf8_lossy(header)
        )));
    }

    // All four bytes are ASCII hex digits at this point
    let text = std::str::from_utf8(header).map_err(|e| AdbError::Protocol(e.to_string()))?;
    usize::from_str_radix(text, 16).map_err(|e| AdbError::Protocol(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingForHeader,
    WaitingForPayload { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting replies
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            state: State::WaitingForHeader,
        }
    }

    /// Append bytes read from the socket
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete frame payload, or `None` if more bytes are needed
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, AdbError> {
        if self.state == State::WaitingForHeader {
            if self.buffer.len() < HEADER_LEN {
                return Ok(None);
            }

            let remaining = parse_length(&self.buffer[..HEADER_LEN])?;
            let _ = self.buffer.split_to(HEADER_LEN);
            self.state = State::WaitingForPayload { remaining };
        }

        match self.state {
            State::WaitingForPayload { remaining } if self.buffer.len() >= remaining => {
                self.state = State::WaitingForHeader;
                Ok(Some(self.buffer.split_to(remaining).freeze()))
            }
            _ => Ok(None),
        }
    }

    /// Take a 4 byte status reply. Not available while a frame is half read.
    pub fn take_status(&mut self) -> Option<[u8; HEADER_LEN]> {
        if self.state != State::WaitingForHeader || self.buffer.len() < HEADER_LEN {
            return None;
        }

        let mut status = [0u8; HEADER_LEN];
        status.copy_from_slice(&self.buffer.split_to(HEADER_LEN));
        Some(status)
    }

    /// Take every buffered byte, used for unframed shell output
    pub fn take_remaining(&mut self) -> Bytes {
        self.state = State::WaitingForHeader;
        self.buffer.split().freeze()
    }

    /// Get the number of buffered bytes
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop buffered bytes and any half read frame
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
