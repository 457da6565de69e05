//! A mock Daly BMS slave behind a loopback serial link.
//!
//! The link behaves like the real half-duplex wiring: written request
//! bytes are echoed straight back onto the read side, followed by the
//! slave's response frames. Only the commands the controller actually
//! polls are answered; anything else stays silent, which exercises the
//! controller's no-retry failure model.

use packmon_daly_lib::{ByteLink, Frame, FrameReceiver};
use std::collections::VecDeque;

/// Electrical state of the simulated pack.
pub struct PackModel {
    pub cells: u8,
    pub sensors: u8,
    pub cell_voltage_mv: u16,
    pub temperature_c: i8,
    pub soc_decipct: u16,
    pub current_deciamp_offset: i16,
    pub cycles: u16,
}

impl Default for PackModel {
    fn default() -> Self {
        Self {
            cells: 8,
            sensors: 2,
            cell_voltage_mv: 3305,
            temperature_c: 24,
            soc_decipct: 870,
            current_deciamp_offset: -15,
            cycles: 112,
        }
    }
}

impl PackModel {
    fn pack_voltage_deci(&self) -> u16 {
        // 8 x 3.305 V = 26.44 V -> 264 decivolts
        (u32::from(self.cells) * u32::from(self.cell_voltage_mv) / 100) as u16
    }

    fn frame(command: u8, data: [u8; 8]) -> Frame {
        let mut frame = Frame::request(command);
        for (offset, byte) in data.into_iter().enumerate() {
            frame = frame.set_u8(offset, byte);
        }
        frame.finalize()
    }

    fn respond(&self, command: u8) -> Vec<Frame> {
        let raw_temp = (i16::from(self.temperature_c) + 40) as u8;
        match command {
            0x90 => {
                let voltage = self.pack_voltage_deci();
                let current = (30000 + i32::from(self.current_deciamp_offset)) as u16;
                vec![Self::frame(
                    0x90,
                    [
                        (voltage >> 8) as u8,
                        voltage as u8,
                        0,
                        0,
                        (current >> 8) as u8,
                        current as u8,
                        (self.soc_decipct >> 8) as u8,
                        self.soc_decipct as u8,
                    ],
                )]
            }
            0x91 => vec![Self::frame(
                0x91,
                [
                    (self.cell_voltage_mv >> 8) as u8,
                    self.cell_voltage_mv as u8,
                    1,
                    ((self.cell_voltage_mv - 12) >> 8) as u8,
                    (self.cell_voltage_mv - 12) as u8,
                    self.cells,
                    0,
                    0,
                ],
            )],
            0x92 => vec![Self::frame(0x92, [raw_temp + 1, 1, raw_temp, 2, 0, 0, 0, 0])],
            0x93 => vec![Self::frame(0x93, [0x02, 1, 1, 7, 0x00, 0x00, 0x4E, 0x20])],
            0x94 => vec![Self::frame(0x94, [self.cells, self.sensors, 0, 1, 0, (self.cycles >> 8) as u8, self.cycles as u8, 0])],
            0x95 => {
                let mut frames = Vec::new();
                let mut cell = 0u8;
                let mut sequence = 1u8;
                while cell < self.cells {
                    let mut data = [0u8; 8];
                    data[0] = sequence;
                    for slot in 0..3 {
                        if cell + slot < self.cells {
                            let millivolts = self.cell_voltage_mv + u16::from(cell + slot);
                            data[1 + slot as usize * 2] = (millivolts >> 8) as u8;
                            data[2 + slot as usize * 2] = millivolts as u8;
                        }
                    }
                    frames.push(Self::frame(0x95, data));
                    cell += 3;
                    sequence += 1;
                }
                frames
            }
            0x96 => {
                let mut data = [0u8; 8];
                data[0] = 1;
                for sensor in 0..usize::from(self.sensors.min(7)) {
                    data[1 + sensor] = raw_temp + sensor as u8;
                }
                vec![Self::frame(0x96, data)]
            }
            0x97 => vec![Self::frame(0x97, [0b0000_0011, 0, 0, 0, 0, 0, 0, 1])],
            0x98 => vec![Self::frame(0x98, [0, 0, 0, 0, 0, 0, 0, 0])],
            _ => Vec::new(),
        }
    }
}

/// Loopback serial: echoes writes, then queues the slave's answer.
pub struct MockBmsLink {
    model: PackModel,
    receiver: FrameReceiver,
    inbound: VecDeque<u8>,
}

impl MockBmsLink {
    #[must_use]
    pub fn new(model: PackModel) -> Self {
        Self {
            model,
            receiver: FrameReceiver::new(),
            inbound: VecDeque::new(),
        }
    }
}

impl ByteLink for MockBmsLink {
    fn read_byte(&mut self) -> Option<u8> {
        self.inbound.pop_front()
    }

    fn write(&mut self, bytes: &[u8]) -> bool {
        // Half-duplex echo first, as the shared line would.
        self.inbound.extend(bytes.iter().copied());
        for &byte in bytes {
            if let Some(request) = self.receiver.feed(byte) {
                for response in self.model.respond(request.command()) {
                    self.inbound.extend(response.as_bytes());
                }
            }
        }
        true
    }
}
