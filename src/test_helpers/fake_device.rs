//! In-memory serial DFU bootloader for protocol tests.
//!
//! Decodes SLIP requests as they are written and queues the responses a
//! bootloader would send. Faults (silent pings, dropped acknowledgments,
//! skewed offsets) are injected through `FakeBootloader::configure`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::dfu::config::{
    DfuOpcode, DfuResultCode, FlowControl, ObjectType, TransportConfig, SLIP_END, SLIP_ESC,
    SLIP_ESC_END, SLIP_ESC_ESC,
};
use crate::dfu::error::{TransportError, TransportResult};
use crate::dfu::link::SerialLink;
use crate::dfu::packet::{crc32, response_frame};
use crate::dfu::slip;
use crate::dfu::transport::Connector;

/// Something the device observed, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Ping(u8),
    SetPrn(u16),
    Select(ObjectType),
    Create(ObjectType, u32),
    /// WriteObject frame with its payload length.
    Write(ObjectType, usize),
    /// Offset reported by a notification or CalcChecksum response.
    Ack(ObjectType, u32),
    /// An acknowledgment that was swallowed; received data rolled back.
    AckDropped,
    Execute(ObjectType),
    /// Bytes that were not a DFU request.
    Text(Vec<u8>),
}

/// One init packet and the firmware written after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedImage {
    pub init_packet: Vec<u8>,
    pub firmware: Vec<u8>,
}

/// Device behaviour and state, shared by every link it hands out.
#[derive(Debug)]
pub struct DeviceState {
    // Behaviour
    pub ignore_pings: usize,
    pub ping_mismatch: bool,
    /// Answer each ping with the previous ping's id before its own.
    pub echo_previous_ping: bool,
    pub fail_open: bool,
    pub command_max_size: u32,
    pub data_max_size: u32,
    pub drop_data_acks: usize,
    pub data_offset_skew: u32,
    pub corrupt_crc: bool,
    pub reject_execute: bool,
    /// Execute without responding.
    pub silent_execute: bool,

    // Protocol state
    last_ping: Option<u8>,
    prn: u16,
    writes_since_ack: usize,
    object_type: ObjectType,
    command: Vec<u8>,
    acked_len: usize,
    images: Vec<ReceivedImage>,

    // Link state
    raw: Vec<u8>,
    outbox: VecDeque<u8>,
    opens: usize,
    last_flow_control: Option<FlowControl>,
    events: Vec<DeviceEvent>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            ignore_pings: 0,
            ping_mismatch: false,
            echo_previous_ping: false,
            fail_open: false,
            command_max_size: 256,
            data_max_size: 4096,
            drop_data_acks: 0,
            data_offset_skew: 0,
            corrupt_crc: false,
            reject_execute: false,
            silent_execute: false,
            last_ping: None,
            prn: 0,
            writes_since_ack: 0,
            object_type: ObjectType::Command,
            command: Vec::new(),
            acked_len: 0,
            images: Vec::new(),
            raw: Vec::new(),
            outbox: VecDeque::new(),
            opens: 0,
            last_flow_control: None,
            events: Vec::new(),
        }
    }
}

impl DeviceState {
    fn receive(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == SLIP_END {
                let raw = std::mem::take(&mut self.raw);
                if !raw.is_empty() {
                    self.handle_frame(unescape(&raw));
                }
            } else {
                self.raw.push(byte);
            }
        }
    }

    fn flush_text(&mut self) {
        if !self.raw.is_empty() {
            let text = std::mem::take(&mut self.raw);
            self.events.push(DeviceEvent::Text(text));
        }
    }

    fn respond(&mut self, opcode: DfuOpcode, result: DfuResultCode, payload: &[u8]) {
        let frame = slip::encode(&response_frame(opcode, result, payload));
        self.outbox.extend(frame);
    }

    fn buffer(&mut self) -> &mut Vec<u8> {
        match self.object_type {
            ObjectType::Command => &mut self.command,
            ObjectType::Data => {
                if self.images.is_empty() {
                    self.images.push(ReceivedImage::default());
                }
                let last = self.images.len() - 1;
                &mut self.images[last].firmware
            }
        }
    }

    fn handle_frame(&mut self, frame: Vec<u8>) {
        let opcode = frame.first().copied().and_then(DfuOpcode::from_byte);
        match opcode {
            Some(DfuOpcode::Ping) if frame.len() == 2 => {
                let id = frame[1];
                self.events.push(DeviceEvent::Ping(id));
                let previous = self.last_ping.replace(id);
                if self.ignore_pings > 0 {
                    self.ignore_pings -= 1;
                    return;
                }
                if let (true, Some(previous)) = (self.echo_previous_ping, previous) {
                    self.respond(DfuOpcode::Ping, DfuResultCode::Success, &[previous]);
                }
                let echoed = if self.ping_mismatch { id ^ 0xFF } else { id };
                self.respond(DfuOpcode::Ping, DfuResultCode::Success, &[echoed]);
            }
            Some(DfuOpcode::SetPrn) if frame.len() == 3 => {
                self.prn = u16::from_le_bytes([frame[1], frame[2]]);
                self.events.push(DeviceEvent::SetPrn(self.prn));
                self.respond(DfuOpcode::SetPrn, DfuResultCode::Success, &[]);
            }
            Some(DfuOpcode::SelectObject) if frame.len() == 2 => {
                let object_type = object_type(frame[1]);
                self.object_type = object_type;
                self.events.push(DeviceEvent::Select(object_type));
                let max_size = match object_type {
                    ObjectType::Command => self.command_max_size,
                    ObjectType::Data => self.data_max_size,
                };
                let buffer = self.buffer().clone();
                let mut payload = max_size.to_le_bytes().to_vec();
                payload.extend_from_slice(&(buffer.len() as u32).to_le_bytes());
                payload.extend_from_slice(&crc32(&buffer).to_le_bytes());
                self.respond(DfuOpcode::SelectObject, DfuResultCode::Success, &payload);
            }
            Some(DfuOpcode::CreateObject) if frame.len() == 6 => {
                let object_type = object_type(frame[1]);
                let size = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
                self.object_type = object_type;
                self.events.push(DeviceEvent::Create(object_type, size));
                if object_type == ObjectType::Command {
                    self.command.clear();
                }
                self.acked_len = self.buffer().len();
                self.writes_since_ack = 0;
                self.respond(DfuOpcode::CreateObject, DfuResultCode::Success, &[]);
            }
            Some(DfuOpcode::WriteObject) => {
                let object_type = self.object_type;
                self.events.push(DeviceEvent::Write(object_type, frame.len() - 1));
                self.buffer().extend_from_slice(&frame[1..]);
                self.writes_since_ack += 1;
                if self.prn != 0 && self.writes_since_ack == self.prn as usize {
                    self.acknowledge();
                }
            }
            Some(DfuOpcode::CalcChecksum) if frame.len() == 1 => {
                self.acknowledge();
            }
            Some(DfuOpcode::Execute) if frame.len() == 1 => {
                let object_type = self.object_type;
                self.events.push(DeviceEvent::Execute(object_type));
                if self.reject_execute {
                    self.respond(
                        DfuOpcode::Execute,
                        DfuResultCode::OperationNotPermitted,
                        &[],
                    );
                    return;
                }
                if object_type == ObjectType::Command {
                    self.images.push(ReceivedImage {
                        init_packet: self.command.clone(),
                        firmware: Vec::new(),
                    });
                }
                if self.silent_execute {
                    return;
                }
                self.respond(DfuOpcode::Execute, DfuResultCode::Success, &[]);
            }
            _ => self.events.push(DeviceEvent::Text(frame)),
        }
    }

    fn acknowledge(&mut self) {
        self.writes_since_ack = 0;
        let object_type = self.object_type;

        if object_type == ObjectType::Data && self.drop_data_acks > 0 {
            self.drop_data_acks -= 1;
            let acked_len = self.acked_len;
            self.buffer().truncate(acked_len);
            self.events.push(DeviceEvent::AckDropped);
            return;
        }

        let buffer = self.buffer().clone();
        self.acked_len = buffer.len();

        let mut offset = buffer.len() as u32;
        if object_type == ObjectType::Data {
            offset += self.data_offset_skew;
        }
        let mut crc = crc32(&buffer);
        if self.corrupt_crc {
            crc = !crc;
        }

        self.events.push(DeviceEvent::Ack(object_type, offset));
        let mut payload = offset.to_le_bytes().to_vec();
        payload.extend_from_slice(&crc.to_le_bytes());
        self.respond(DfuOpcode::CalcChecksum, DfuResultCode::Success, &payload);
    }
}

fn object_type(byte: u8) -> ObjectType {
    if byte == ObjectType::Data as u8 {
        ObjectType::Data
    } else {
        ObjectType::Command
    }
}

fn unescape(raw: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(raw.len());
    let mut escaped = false;
    for &byte in raw {
        if escaped {
            frame.push(match byte {
                SLIP_ESC_END => SLIP_END,
                SLIP_ESC_ESC => SLIP_ESC,
                other => other,
            });
            escaped = false;
        } else if byte == SLIP_ESC {
            escaped = true;
        } else {
            frame.push(byte);
        }
    }
    frame
}

/// Handle to a simulated bootloader. Clones share the same device.
#[derive(Debug, Clone, Default)]
pub struct FakeBootloader {
    state: Arc<Mutex<DeviceState>>,
}

impl FakeBootloader {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().expect("fake device lock poisoned")
    }

    /// Adjust device behaviour.
    pub fn configure(&self, f: impl FnOnce(&mut DeviceState)) {
        f(&mut self.lock());
    }

    /// Connector handing out links to this device.
    pub fn connector(&self) -> Connector {
        let device = self.clone();
        Box::new(move |config: &TransportConfig| {
            let mut state = device.lock();
            if state.fail_open {
                return Err(TransportError::PortUnavailable {
                    port: config.port.clone(),
                    reason: "no such device".to_string(),
                });
            }
            state.opens += 1;
            state.last_flow_control = Some(config.flow_control);
            state.raw.clear();
            state.outbox.clear();
            drop(state);
            Ok(Box::new(device.clone()) as Box<dyn SerialLink>)
        })
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.lock().events.clone()
    }

    pub fn count(&self, predicate: impl Fn(&DeviceEvent) -> bool) -> usize {
        self.lock().events.iter().filter(|e| predicate(e)).count()
    }

    pub fn images(&self) -> Vec<ReceivedImage> {
        self.lock().images.clone()
    }

    pub fn prn(&self) -> u16 {
        self.lock().prn
    }

    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn last_open_flow_control(&self) -> Option<FlowControl> {
        self.lock().last_flow_control
    }
}

impl SerialLink for FakeBootloader {
    fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        self.lock().receive(data);
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        {
            let mut state = self.lock();
            if !state.outbox.is_empty() {
                let n = buffer.len().min(state.outbox.len());
                for (slot, byte) in buffer.iter_mut().zip(state.outbox.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }

        std::thread::sleep(timeout.min(Duration::from_millis(2)));
        Ok(0)
    }

    fn flush(&mut self) -> TransportResult<()> {
        self.lock().flush_text();
        Ok(())
    }

    fn clear_input(&mut self) -> TransportResult<()> {
        self.lock().outbox.clear();
        Ok(())
    }
}
