//! Request/response session over a shared half-duplex serial line.
//!
//! A [`Session`] exclusively owns one byte link and every response slot
//! for that unit. Writing a request immediately steps the receiver so a
//! synchronous echo of our own bytes is absorbed rather than dispatched.
//! Received frames are dispatched to the slot registered for their
//! command byte; a slot completing its final expected frame is reported
//! to the caller once.

use log::{debug, trace, warn};

use crate::frame::{Frame, FrameReceiver};
use crate::response::{
    BatteryCode, BatteryInfo, BatteryRatings, BatteryStat, CellBalanceThresholds, CellBalances,
    CellSensorThresholds, CellTemperatureMinmax, CellTemperatures, CellVoltageMinmax,
    CellVoltageThresholds, CellVoltages, FailureStatus, FirmwareIndex, HardwareConfig,
    HardwareVersion, MosfetStatus, PackCurrentThresholds, PackInfo, PackSocThresholds,
    PackStatus, PackTemperatureThresholds, PackVoltageThresholds, Response, Rtc,
    ShortCircuitThresholds, SoftwareVersion, mosfet_charge_request, mosfet_discharge_request,
    reset_request,
};

/// One byte in, many bytes out. The sole hardware seam of this crate.
pub trait ByteLink {
    /// Non-blocking single byte read.
    fn read_byte(&mut self) -> Option<u8>;
    /// Write a buffer; returns false when the link rejected it.
    fn write(&mut self, bytes: &[u8]) -> bool;
}

impl<T: ByteLink + ?Sized> ByteLink for Box<T> {
    fn read_byte(&mut self) -> Option<u8> {
        (**self).read_byte()
    }
    fn write(&mut self, bytes: &[u8]) -> bool {
        (**self).write(bytes)
    }
}

/// Static, rarely refreshed unit information.
#[derive(Debug, Default)]
pub struct Information {
    pub hardware_config: Response<HardwareConfig>,
    pub hardware_version: Response<HardwareVersion>,
    pub firmware_index: Response<FirmwareIndex>,
    pub software_version: Response<SoftwareVersion>,
    pub battery_ratings: Response<BatteryRatings>,
    pub battery_code: Response<BatteryCode>,
    pub battery_info: Response<BatteryInfo>,
    pub battery_stat: Response<BatteryStat>,
    pub rtc: Response<Rtc>,
}

/// Configured protection thresholds.
#[derive(Debug, Default)]
pub struct Thresholds {
    pub pack_voltages: Response<PackVoltageThresholds>,
    pub pack_currents: Response<PackCurrentThresholds>,
    pub pack_temperatures: Response<PackTemperatureThresholds>,
    pub pack_soc: Response<PackSocThresholds>,
    pub cell_voltages: Response<CellVoltageThresholds>,
    pub cell_sensors: Response<CellSensorThresholds>,
    pub cell_balances: Response<CellBalanceThresholds>,
    pub pack_shortcircuit: Response<ShortCircuitThresholds>,
}

/// Live pack status.
#[derive(Debug, Default)]
pub struct Status {
    pub pack: Response<PackStatus>,
    pub cell_voltages: Response<CellVoltageMinmax>,
    pub cell_temperatures: Response<CellTemperatureMinmax>,
    pub fets: Response<MosfetStatus>,
    pub info: Response<PackInfo>,
    pub failures: Response<FailureStatus>,
}

/// Per-cell diagnostics; sized from the pack information response.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub voltages: Response<CellVoltages>,
    pub temperatures: Response<CellTemperatures>,
    pub balances: Response<CellBalances>,
}

/// Traffic counters for diagnostics reporting.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkCounters {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_unhandled: u64,
    pub write_failures: u64,
}

/// Observes outgoing request frames (logging, capture); distinct from the
/// completion reporting of [`Session::process`].
pub type FrameListener = Box<dyn FnMut(&Frame)>;

pub struct Session<L: ByteLink> {
    id: String,
    link: L,
    receiver: FrameReceiver,
    sized: bool,
    completed: Vec<u8>,
    listener: Option<FrameListener>,
    pub counters: LinkCounters,
    pub information: Information,
    pub thresholds: Thresholds,
    pub status: Status,
    pub diagnostics: Diagnostics,
}

impl<L: ByteLink> Session<L> {
    pub fn new(id: impl Into<String>, link: L) -> Self {
        Self {
            id: id.into(),
            link,
            receiver: FrameReceiver::new(),
            sized: false,
            completed: Vec::new(),
            listener: None,
            counters: LinkCounters::default(),
            information: Information::default(),
            thresholds: Thresholds::default(),
            status: Status::default(),
            diagnostics: Diagnostics::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the per-cell arrays have been sized from pack information.
    #[must_use]
    pub fn is_sized(&self) -> bool {
        self.sized
    }

    /// Install a transmit-side observer; it sees every request frame as
    /// it is written.
    pub fn set_listener(&mut self, listener: FrameListener) {
        self.listener = Some(listener);
    }

    /// Kick off the initial information sweep.
    pub fn begin(&mut self) -> Vec<u8> {
        debug!("DalyBMS[{}]: begin", self.id);
        self.request_initial()
    }

    /// Drain the link, feeding the receiver. Returns every command that
    /// became valid since the previous call (including responses that
    /// arrived synchronously while a request was being written).
    pub fn process(&mut self) -> Vec<u8> {
        while let Some(byte) = self.link.read_byte() {
            if let Some(frame) = self.receiver.feed(byte) {
                self.counters.frames_received += 1;
                trace!("DalyBMS[{}]: recv: {frame}", self.id);
                self.dispatch(&frame);
            }
        }
        std::mem::take(&mut self.completed)
    }

    /// Write one request and absorb its synchronous echo. A frame read
    /// back during the absorb step that is byte-identical to the request
    /// is dropped; anything else (a fast slave) is dispatched normally.
    fn send(&mut self, request: Frame) {
        debug!("DalyBMS[{}]: send: {request}", self.id);
        if let Some(listener) = self.listener.as_mut() {
            listener(&request);
        }
        self.counters.frames_sent += 1;
        if !self.link.write(request.as_bytes()) {
            self.counters.write_failures += 1;
            warn!("DalyBMS[{}]: send: link rejected {request}", self.id);
            return;
        }
        while let Some(byte) = self.link.read_byte() {
            if let Some(frame) = self.receiver.feed(byte) {
                if frame == request {
                    trace!("DalyBMS[{}]: absorbed echo of {request}", self.id);
                    continue;
                }
                self.counters.frames_received += 1;
                self.dispatch(&frame);
            }
        }
    }

    fn dispatch(&mut self, frame: &Frame) {
        let command = frame.command();
        let completed = match command {
            0x50 => self.information.battery_ratings.accept(frame),
            0x51 => self.information.hardware_config.accept(frame),
            0x52 => self.information.battery_stat.accept(frame),
            0x53 => self.information.battery_info.accept(frame),
            0x54 => self.information.firmware_index.accept(frame),
            0x57 => self.information.battery_code.accept(frame),
            0x59 => self.thresholds.cell_voltages.accept(frame),
            0x5A => self.thresholds.pack_voltages.accept(frame),
            0x5B => self.thresholds.pack_currents.accept(frame),
            0x5C => self.thresholds.pack_temperatures.accept(frame),
            0x5D => self.thresholds.pack_soc.accept(frame),
            0x5E => self.thresholds.cell_sensors.accept(frame),
            0x5F => self.thresholds.cell_balances.accept(frame),
            0x60 => self.thresholds.pack_shortcircuit.accept(frame),
            0x61 => self.information.rtc.accept(frame),
            0x62 => self.information.software_version.accept(frame),
            0x63 => self.information.hardware_version.accept(frame),
            0x90 => self.status.pack.accept(frame),
            0x91 => self.status.cell_voltages.accept(frame),
            0x92 => self.status.cell_temperatures.accept(frame),
            0x93 => self.status.fets.accept(frame),
            0x94 => self.status.info.accept(frame),
            0x95 => self.diagnostics.voltages.accept(frame),
            0x96 => self.diagnostics.temperatures.accept(frame),
            0x97 => self.diagnostics.balances.accept(frame),
            0x98 => self.status.failures.accept(frame),
            _ => {
                self.counters.frames_unhandled += 1;
                trace!("DalyBMS[{}]: unhandled command 0x{command:02X}", self.id);
                false
            }
        };
        if !completed {
            return;
        }
        if command == 0x94 && !self.sized {
            self.size_arrays();
        }
        self.completed.push(command);
    }

    /// Size the per-cell arrays from the reported cell and sensor counts.
    fn size_arrays(&mut self) {
        let Some(info) = self.status.info.get() else {
            return;
        };
        let (cells, sensors) = (usize::from(info.cells), usize::from(info.sensors));
        let ok = self.diagnostics.voltages.value_mut().set_count(cells)
            && self.diagnostics.temperatures.value_mut().set_count(sensors)
            && self.diagnostics.balances.value_mut().set_count(cells);
        if ok {
            debug!("DalyBMS[{}]: sized arrays, cells={cells}, sensors={sensors}", self.id);
            self.sized = true;
        } else {
            warn!("DalyBMS[{}]: implausible pack info, cells={cells}, sensors={sensors}", self.id);
        }
    }

    /// Issue only the pack status request (the cheap "instant" poll).
    pub fn request_instant(&mut self) {
        if let Some(request) = self.status.pack.request() {
            self.send(request);
        }
    }

    /// Issue the live status group.
    pub fn request_status(&mut self) {
        let requests = [
            self.status.pack.request(),
            self.status.cell_voltages.request(),
            self.status.cell_temperatures.request(),
            self.status.fets.request(),
            self.status.info.request(),
            self.status.failures.request(),
        ];
        for request in requests.into_iter().flatten() {
            self.send(request);
        }
    }

    /// Issue the per-cell diagnostics group (no-ops until sized).
    pub fn request_diagnostics(&mut self) {
        let requests = [
            self.diagnostics.voltages.request(),
            self.diagnostics.temperatures.request(),
            self.diagnostics.balances.request(),
        ];
        for request in requests.into_iter().flatten() {
            self.send(request);
        }
    }

    /// Issue the full initial sweep: information, thresholds, status and
    /// diagnostics.
    pub fn request_initial(&mut self) -> Vec<u8> {
        let requests = [
            self.information.hardware_config.request(),
            self.information.hardware_version.request(),
            self.information.firmware_index.request(),
            self.information.software_version.request(),
            self.information.battery_ratings.request(),
            self.information.battery_code.request(),
            self.information.battery_info.request(),
            self.information.battery_stat.request(),
            self.information.rtc.request(),
            self.thresholds.pack_voltages.request(),
            self.thresholds.pack_currents.request(),
            self.thresholds.pack_temperatures.request(),
            self.thresholds.pack_soc.request(),
            self.thresholds.cell_voltages.request(),
            self.thresholds.cell_sensors.request(),
            self.thresholds.cell_balances.request(),
            self.thresholds.pack_shortcircuit.request(),
        ];
        for request in requests.into_iter().flatten() {
            self.send(request);
        }
        self.request_status();
        self.request_diagnostics();
        self.process()
    }

    /// Write-only 0x00 reset.
    pub fn send_reset(&mut self) {
        self.send(reset_request());
    }

    /// Write-only 0xDA charge MOSFET enable.
    pub fn set_charge_mosfet(&mut self, on: bool) {
        self.send(mosfet_charge_request(on));
    }

    /// Write-only 0xD9 discharge MOSFET enable.
    pub fn set_discharge_mosfet(&mut self, on: bool) {
        self.send(mosfet_discharge_request(on));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// A scripted link: echoes writes back (half-duplex) and plays back
    /// queued response frames.
    #[derive(Default)]
    struct LoopbackLink {
        echo: bool,
        inbound: VecDeque<u8>,
        written: Vec<Frame>,
    }

    impl LoopbackLink {
        fn queue(&mut self, frame: Frame) {
            self.inbound.extend(frame.as_bytes());
        }
    }

    impl ByteLink for LoopbackLink {
        fn read_byte(&mut self) -> Option<u8> {
            self.inbound.pop_front()
        }
        fn write(&mut self, bytes: &[u8]) -> bool {
            let mut buffer = [0u8; crate::frame::FRAME_SIZE];
            buffer.copy_from_slice(bytes);
            let frame = Frame::from_bytes(buffer);
            self.written.push(frame);
            if self.echo {
                self.inbound.extend(bytes);
            }
            true
        }
    }

    fn status_frame(command: u8, data: [u8; 8]) -> Frame {
        let mut frame = Frame::request(command);
        for (offset, byte) in data.into_iter().enumerate() {
            frame = frame.set_u8(offset, byte);
        }
        frame.finalize()
    }

    #[test]
    fn own_echo_is_absorbed_not_dispatched() {
        let mut session = Session::new("manager", LoopbackLink { echo: true, ..Default::default() });
        session.request_instant();
        // The echoed request must not have validated the pack status slot
        // with a zeroed payload.
        assert!(!session.status.pack.is_valid());
        assert_eq!(session.counters.frames_received, 0);
    }

    #[test]
    fn response_after_echo_is_dispatched() {
        let mut link = LoopbackLink { echo: true, ..Default::default() };
        link.queue(status_frame(0x90, [0x00, 0x64, 0x00, 0x00, 0x75, 0x30, 0x03, 0xE8]));
        // The request's echo arrives *after* the queued response here, so
        // exercise the other interleaving via process() as well.
        let mut session = Session::new("manager", link);
        let completed = session.process();
        assert_eq!(completed, vec![0x90]);
        assert_eq!(session.status.pack.get().expect("valid").voltage_v, 10.0);
    }

    #[test]
    fn pack_info_sizes_diagnostic_arrays_once() {
        let mut session = Session::new("manager", LoopbackLink::default());
        assert!(!session.is_sized());
        session.link.queue(status_frame(0x94, [8, 2, 0, 0, 0, 0, 0, 1]));
        session.process();
        assert!(session.is_sized());
        assert_eq!(session.diagnostics.voltages.value().values.len(), 8);
        assert_eq!(session.diagnostics.temperatures.value().values.len(), 2);
        assert_eq!(session.diagnostics.balances.value().states.len(), 8);

        // Sized arrays become requestable.
        session.request_diagnostics();
        let issued: Vec<u8> = session.link.written.iter().map(Frame::command).collect();
        assert_eq!(issued, vec![0x95, 0x96, 0x97]);
    }

    #[test]
    fn listener_sees_transmitted_frames() {
        use std::cell::RefCell;
        use std::rc::Rc;
        let seen: Rc<RefCell<Vec<u8>>> = Rc::default();
        let sink = seen.clone();
        let mut session = Session::new("manager", LoopbackLink::default());
        session.set_listener(Box::new(move |frame| sink.borrow_mut().push(frame.command())));
        session.request_instant();
        session.request_instant();
        assert_eq!(*seen.borrow(), vec![0x90, 0x90]);
    }

    #[test]
    fn unhandled_commands_are_counted() {
        let mut session = Session::new("manager", LoopbackLink::default());
        session.link.queue(status_frame(0x42, [0; 8]));
        assert!(session.process().is_empty());
        assert_eq!(session.counters.frames_unhandled, 1);
    }

    #[test]
    fn multi_frame_assembly_across_process_calls() {
        let mut session = Session::new("manager", LoopbackLink::default());
        session.link.queue(status_frame(0x94, [8, 2, 0, 0, 0, 0, 0, 1]));
        session.process();
        session.request_diagnostics();

        session.link.queue(status_frame(0x95, [1, 0x0C, 0xE4, 0x0C, 0xE5, 0x0C, 0xE6, 0]));
        session.link.queue(status_frame(0x95, [2, 0x0C, 0xE7, 0x0C, 0xE8, 0x0C, 0xE9, 0]));
        assert!(session.process().is_empty());
        session.link.queue(status_frame(0x95, [3, 0x0C, 0xEA, 0x0C, 0xEB, 0, 0, 0]));
        assert_eq!(session.process(), vec![0x95]);
        let voltages = session.diagnostics.voltages.get().expect("complete");
        assert_eq!(voltages.values.len(), 8);
        assert_eq!(voltages.values[0], 3.300);
    }
}
