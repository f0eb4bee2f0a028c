//! SLIP (Serial Line Internet Protocol) framing.
//!
//! Implements RFC 1055 for framing DFU requests and responses.
//! See: https://datatracker.ietf.org/doc/html/rfc1055

use super::config::{MAX_SLIP_FRAME_SIZE, SLIP_END, SLIP_ESC, SLIP_ESC_END, SLIP_ESC_ESC};
use super::error::{TransportError, TransportResult};

/// Encode a frame, escaping special bytes and appending the END delimiter.
///
/// The bootloader only needs a trailing END; a leading one is not sent.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() * 2 + 1);

    for &byte in data {
        match byte {
            SLIP_END => {
                encoded.push(SLIP_ESC);
                encoded.push(SLIP_ESC_END);
            }
            SLIP_ESC => {
                encoded.push(SLIP_ESC);
                encoded.push(SLIP_ESC_ESC);
            }
            _ => encoded.push(byte),
        }
    }

    encoded.push(SLIP_END);
    encoded
}

/// Streaming SLIP decoder for frames arriving from the serial port in pieces.
#[derive(Debug)]
pub struct SlipDecoder {
    buffer: Vec<u8>,
    escape_next: bool,
    /// Set after a framing error; bytes are dropped until the next END.
    discarding: bool,
    max_frame_size: usize,
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_SLIP_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            escape_next: false,
            discarding: false,
            max_frame_size,
        }
    }

    /// Feed a byte to the decoder.
    ///
    /// # Returns
    /// - `Some(Ok(data))` if a complete frame was received
    /// - `Some(Err(e))` on an invalid escape or an oversized frame
    /// - `None` if more data is needed
    ///
    /// Empty frames (back-to-back END bytes) are skipped. After an error the
    /// rest of the broken frame is dropped up to its END.
    pub fn feed(&mut self, byte: u8) -> Option<TransportResult<Vec<u8>>> {
        if byte == SLIP_END {
            self.escape_next = false;
            if std::mem::take(&mut self.discarding) || self.buffer.is_empty() {
                return None;
            }
            return Some(Ok(std::mem::take(&mut self.buffer)));
        }

        if self.discarding {
            return None;
        }

        if self.buffer.len() >= self.max_frame_size {
            let size = self.buffer.len();
            self.discard();
            return Some(Err(TransportError::SlipBufferOverflow {
                size,
                max_size: self.max_frame_size,
            }));
        }

        if self.escape_next {
            self.escape_next = false;
            match byte {
                SLIP_ESC_END => self.buffer.push(SLIP_END),
                SLIP_ESC_ESC => self.buffer.push(SLIP_ESC),
                _ => {
                    self.discard();
                    return Some(Err(TransportError::InvalidSlipEscape));
                }
            }
        } else if byte == SLIP_ESC {
            self.escape_next = true;
        } else {
            self.buffer.push(byte);
        }

        None
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.escape_next = false;
        self.discarding = false;
    }

    fn discard(&mut self) {
        self.reset();
        self.discarding = true;
    }

    /// Number of bytes buffered for the frame in progress.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
