//! Serial DFU transport engine.
//!
//! Owns one serial session at a time and pushes init packets and firmware
//! images to the bootloader:
//! 1. Open - open the port, optional connect delay, optional ping handshake, set PRN
//! 2. Init packet - select/create a command object, stream it, execute
//! 3. Firmware - split into data objects; stream each, verify, execute
//!
//! Streaming sends WriteObject frames in windows of `prn` frames. Every window
//! is acknowledged with the device's running offset and CRC32, which must match
//! what was sent. A window whose acknowledgment times out is sent again.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, trace, warn};

use super::config::{DfuOpcode, FlowControl, ObjectType, TransportConfig, MAX_ACK_ATTEMPTS};
use super::error::{TransportError, TransportResult, TransportState};
use super::link::{SerialLink, SerialPortLink};
use super::packet::{
    calc_checksum_request, crc32_update, create_object_request, execute_request, parse_ping,
    ping_request, select_object_request, set_prn_request, write_object_request, Checksum,
    Response, SelectedObject,
};
use super::slip::{self, SlipDecoder};

/// Called with the cumulative number of payload bytes acknowledged so far.
pub type ProgressCallback = Box<dyn FnMut(usize) + Send>;

/// Produces a fresh link for every session.
pub type Connector = Box<dyn FnMut(&TransportConfig) -> TransportResult<Box<dyn SerialLink>> + Send>;

/// Operations the orchestrator needs from a DFU transport.
///
/// This abstraction allows mocking the transport when testing component ordering.
#[cfg_attr(test, automock)]
pub trait DfuTransport: Send {
    /// Open and validate a session.
    fn open(&mut self) -> TransportResult<()>;

    /// Replace the callback invoked for every acknowledged chunk of firmware.
    fn register_progress_callback(&mut self, callback: ProgressCallback);

    /// Transfer an init packet.
    fn send_init_packet(&mut self, init_packet: &[u8]) -> TransportResult<()>;

    /// Transfer a firmware image. The session is closed afterwards.
    fn send_firmware(&mut self, firmware: &[u8]) -> TransportResult<()>;

    /// Close the session, releasing the port. Safe to call when already closed.
    fn close(&mut self);

    /// Write the configured DFU entry text, unframed.
    ///
    /// Returns `Ok(false)` when no trigger is configured.
    fn send_dfu_trigger(&mut self) -> TransportResult<bool>;
}

/// DFU transport over a serial link.
pub struct SerialTransport {
    config: TransportConfig,
    connector: Connector,
    link: Option<Box<dyn SerialLink>>,
    state: TransportState,
    decoder: SlipDecoder,
    frames: VecDeque<Vec<u8>>,
    progress: Option<ProgressCallback>,
    ping_id: u8,
    opened_before: bool,
}

impl SerialTransport {
    /// Create a transport that opens real serial ports.
    pub fn new(config: TransportConfig) -> Self {
        Self::with_connector(config, Box::new(open_serial_port))
    }

    /// Create a transport whose links come from `connector`.
    pub fn with_connector(config: TransportConfig, connector: Connector) -> Self {
        Self {
            config,
            connector,
            link: None,
            state: TransportState::Closed,
            decoder: SlipDecoder::new(),
            frames: VecDeque::new(),
            progress: None,
            ping_id: 0,
            opened_before: false,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    fn try_open(&mut self) -> TransportResult<()> {
        let link = (self.connector)(&self.config)?;
        self.link = Some(link);
        self.decoder.reset();
        self.frames.clear();

        if !self.opened_before {
            self.opened_before = true;
            if let Some(delay) = self.config.connect_delay() {
                debug!(delay_ms = delay.as_millis() as u64, "waiting before handshake");
                std::thread::sleep(delay);
            }
        }

        if self.config.ping {
            self.handshake()?;
        }

        self.request(&set_prn_request(self.config.prn), DfuOpcode::SetPrn)?;
        debug!(prn = self.config.prn, "packet receipt notification set");
        Ok(())
    }

    /// Ping until the device answers or the open window closes.
    fn handshake(&mut self) -> TransportResult<()> {
        let deadline = Instant::now() + self.config.open_timeout();
        let mut sent_ids = Vec::new();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::HandshakeTimeout {
                    timeout_ms: self.config.open_timeout_ms,
                });
            }

            self.ping_id = self.ping_id.wrapping_add(1);
            let id = self.ping_id;
            sent_ids.push(id);
            self.send_frame(&ping_request(id))?;

            let wait = self.config.timeout().min(deadline - now);
            let Some(payload) = self.wait_response(DfuOpcode::Ping, wait)? else {
                debug!(id, "no ping response");
                continue;
            };

            let actual = parse_ping(&payload)?;
            if actual == id {
                debug!(id, "ping answered");
                return Ok(());
            }
            if sent_ids.contains(&actual) {
                // Late answer to an earlier attempt; the current one may still arrive
                debug!(id, actual, "stale ping response");
                if let Some(payload) = self.wait_response(DfuOpcode::Ping, wait)? {
                    let actual = parse_ping(&payload)?;
                    if actual == id {
                        return Ok(());
                    }
                    if !sent_ids.contains(&actual) {
                        return Err(TransportError::HandshakeMismatch { expected: id, actual });
                    }
                }
                continue;
            }

            return Err(TransportError::HandshakeMismatch { expected: id, actual });
        }
    }

    /// Move into `Transferring`, rejecting calls on a closed session.
    fn begin_transfer(&mut self, operation: &'static str) -> TransportResult<()> {
        match self.state {
            TransportState::Validated | TransportState::Transferring => {
                self.state = TransportState::Transferring;
                Ok(())
            }
            state => Err(TransportError::InvalidState { operation, state }),
        }
    }

    fn transfer_init_packet(&mut self, init_packet: &[u8]) -> TransportResult<()> {
        let selected = self.select(ObjectType::Command)?;
        if init_packet.len() > selected.max_size as usize {
            return Err(TransportError::InitPacketTooLarge {
                size: init_packet.len(),
                max_size: selected.max_size as usize,
            });
        }

        self.request(
            &create_object_request(ObjectType::Command, init_packet.len() as u32),
            DfuOpcode::CreateObject,
        )?;
        self.stream_object(init_packet, 0, 0, false)?;
        self.request(&execute_request(), DfuOpcode::Execute)?;

        info!(bytes = init_packet.len(), "init packet accepted");
        Ok(())
    }

    fn transfer_firmware(&mut self, firmware: &[u8]) -> TransportResult<()> {
        let selected = self.select(ObjectType::Data)?;
        if selected.max_size == 0 {
            return Err(TransportError::MalformedResponse {
                reason: "device reports a zero-sized data object".to_string(),
            });
        }
        if selected.offset != 0 {
            debug!(offset = selected.offset, "device holds partial data, restarting from 0");
        }

        let mut offset = 0u32;
        let mut crc = 0u32;
        for (index, object) in firmware.chunks(selected.max_size as usize).enumerate() {
            self.request(
                &create_object_request(ObjectType::Data, object.len() as u32),
                DfuOpcode::CreateObject,
            )?;

            let checksum = self.stream_object(object, offset, crc, true)?;
            offset = checksum.offset;
            crc = checksum.crc;

            self.request(&execute_request(), DfuOpcode::Execute)?;
            debug!(object = index, offset, "data object executed");
        }

        info!(bytes = firmware.len(), crc = format_args!("0x{crc:08X}"), "firmware accepted");
        Ok(())
    }

    fn select(&mut self, object_type: ObjectType) -> TransportResult<SelectedObject> {
        let payload = self.request(&select_object_request(object_type), DfuOpcode::SelectObject)?;
        let selected = SelectedObject::parse(&payload)?;
        debug!(?object_type, max_size = selected.max_size, offset = selected.offset, "object selected");
        Ok(selected)
    }

    /// Stream one object starting at `offset`/`crc`, returning the verified end state.
    fn stream_object(
        &mut self,
        object: &[u8],
        offset: u32,
        crc: u32,
        report_progress: bool,
    ) -> TransportResult<Checksum> {
        let chunks: Vec<&[u8]> = object.chunks(self.config.chunk_size.max(1)).collect();
        let prn = self.config.prn as usize;
        let mut acked = Checksum { offset, crc };
        let mut next = 0;

        while next < chunks.len() {
            let end = if prn == 0 {
                chunks.len()
            } else {
                (next + prn).min(chunks.len())
            };
            let window = &chunks[next..end];
            // A full window is acknowledged by the device's own notification
            let notified = prn != 0 && window.len() == prn;

            let expected = window.iter().fold(acked, |sum, chunk| Checksum {
                offset: sum.offset + chunk.len() as u32,
                crc: crc32_update(sum.crc, chunk),
            });
            let reported = self.acknowledge_window(window, !notified)?;
            verify(expected, reported)?;

            if report_progress {
                if let Some(callback) = self.progress.as_mut() {
                    let mut sent = acked.offset as usize;
                    for chunk in window {
                        sent += chunk.len();
                        callback(sent);
                    }
                }
            }

            acked = expected;
            next = end;

            if notified && next == chunks.len() {
                let reported = self.acknowledge_window(&[], true)?;
                verify(acked, reported)?;
            }
        }

        Ok(acked)
    }

    /// Send a window of chunks and wait for its acknowledgment, resending on timeout.
    fn acknowledge_window(
        &mut self,
        window: &[&[u8]],
        request_checksum: bool,
    ) -> TransportResult<Checksum> {
        for attempt in 1..=MAX_ACK_ATTEMPTS {
            for chunk in window {
                self.send_frame(&write_object_request(chunk))?;
            }
            if request_checksum {
                self.send_frame(&calc_checksum_request())?;
            }

            let acknowledged = self
                .wait_response(DfuOpcode::CalcChecksum, self.config.timeout())?
                .ok_or(TransportError::AckTimeout);

            match acknowledged {
                Ok(payload) => {
                    let checksum = Checksum::parse(&payload)?;
                    debug!(offset = checksum.offset, crc = format_args!("0x{:08X}", checksum.crc), "window acknowledged");
                    return Ok(checksum);
                }
                Err(e) if e.is_retriable() => {
                    warn!(attempt, frames = window.len(), error = %e, "resending window");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TransportError::TransferTimeout {
            attempts: MAX_ACK_ATTEMPTS,
        })
    }

    /// Send a request and return the payload of its successful response.
    fn request(&mut self, request: &[u8], opcode: DfuOpcode) -> TransportResult<Vec<u8>> {
        self.send_frame(request)?;
        self.wait_response(opcode, self.config.timeout())?
            .ok_or(TransportError::ResponseTimeout)
    }

    fn send_frame(&mut self, request: &[u8]) -> TransportResult<()> {
        let state = self.state;
        let link = self.link.as_mut().ok_or(TransportError::InvalidState {
            operation: "write",
            state,
        })?;
        trace!(opcode = request.first().copied().unwrap_or_default(), len = request.len(), "sending frame");
        link.write(&slip::encode(request))
    }

    /// Wait for the response to `opcode`. `Ok(None)` on timeout.
    fn wait_response(
        &mut self,
        opcode: DfuOpcode,
        timeout: Duration,
    ) -> TransportResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(frame) = self.read_frame(remaining)? else {
                return Ok(None);
            };

            let response = match Response::parse(&frame) {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "discarding frame");
                    continue;
                }
            };

            if response.opcode != opcode as u8 {
                warn!(
                    expected = opcode as u8,
                    actual = response.opcode,
                    "discarding response to another request"
                );
                continue;
            }

            return response.into_payload(opcode).map(Some);
        }
    }

    /// Next decoded frame from the device, waiting at most `timeout`.
    fn read_frame(&mut self, timeout: Duration) -> TransportResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut buffer = [0u8; 512];

        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(Some(frame));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let state = self.state;
            let link = self.link.as_mut().ok_or(TransportError::InvalidState {
                operation: "read",
                state,
            })?;
            let bytes_read = link.read(&mut buffer, remaining)?;

            for &byte in &buffer[..bytes_read] {
                match self.decoder.feed(byte) {
                    Some(Ok(frame)) => self.frames.push_back(frame),
                    Some(Err(e)) => warn!(error = %e, "discarding corrupt frame"),
                    None => {}
                }
            }
        }
    }
}

/// Compare what the device acknowledged with what was sent.
fn verify(expected: Checksum, reported: Checksum) -> TransportResult<()> {
    if reported.offset != expected.offset {
        return Err(TransportError::OffsetMismatch {
            expected: expected.offset,
            actual: reported.offset,
        });
    }
    if reported.crc != expected.crc {
        return Err(TransportError::CrcMismatch {
            expected: expected.crc,
            actual: reported.crc,
        });
    }
    Ok(())
}

fn open_serial_port(config: &TransportConfig) -> TransportResult<Box<dyn SerialLink>> {
    let link = SerialPortLink::open(&config.port, config.baud_rate, config.flow_control)?;
    Ok(Box::new(link))
}

impl DfuTransport for SerialTransport {
    fn open(&mut self) -> TransportResult<()> {
        if self.state != TransportState::Closed {
            return Err(TransportError::InvalidState {
                operation: "open",
                state: self.state,
            });
        }

        self.state = TransportState::Opening;
        info!(port = %self.config.port, baud_rate = self.config.baud_rate, "opening DFU session");

        match self.try_open() {
            Ok(()) => {
                self.state = TransportState::Validated;
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn register_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    fn send_init_packet(&mut self, init_packet: &[u8]) -> TransportResult<()> {
        self.begin_transfer("send init packet")?;
        let result = self.transfer_init_packet(init_packet);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn send_firmware(&mut self, firmware: &[u8]) -> TransportResult<()> {
        self.begin_transfer("send firmware")?;
        let result = self.transfer_firmware(firmware);
        self.close();
        result
    }

    fn close(&mut self) {
        if self.link.take().is_some() {
            debug!(port = %self.config.port, "DFU session closed");
        }
        self.state = TransportState::Closed;
        self.decoder.reset();
        self.frames.clear();
    }

    fn send_dfu_trigger(&mut self) -> TransportResult<bool> {
        let Some(text) = self.config.dfu_trigger.clone() else {
            return Ok(false);
        };
        if self.state != TransportState::Closed {
            return Err(TransportError::InvalidState {
                operation: "send DFU trigger",
                state: self.state,
            });
        }

        let trigger_config = TransportConfig {
            flow_control: FlowControl::None,
            ..self.config.clone()
        };
        let mut link = (self.connector)(&trigger_config)?;
        link.write(text.as_bytes())?;
        link.flush()?;

        info!(port = %self.config.port, "DFU entry trigger sent");
        Ok(true)
    }
}
