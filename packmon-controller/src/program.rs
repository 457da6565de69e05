//! The single cooperative scheduler: every component processed once per
//! fixed-cadence tick, leaves first, with the inter-tick sleep as the
//! only suspension point.

use std::rc::Rc;

use log::{info, warn};
use serde_json::{json, Map, Value};

use crate::alarms::{Alarmable, AlarmAggregator, AlarmKind, AlarmSet};
use crate::bms::BmsManager;
use crate::build_identifier;
use crate::calibration::CalibrationManager;
use crate::config::Config;
use crate::control_endpoints::{ControlAction, ControlManager};
use crate::diagnostics::Diagnosticable;
use crate::fans::{FanController, FanLoop};
use crate::kv::KvStore;
use crate::peers::{AccessPoint, BrokerEndpoint, PeerList};
use crate::platform::{
    AdcMux, AlarmOutput, BleScanner, Clock, DateHeaderFetcher, LocalRadio, Mdns, MotorDriver,
    MqttLink, Network, OtaManifest, ReferenceThermometer, SystemProbe, Watchdog, WebServer,
    WebsocketLink,
};
use crate::storage::StoreFile;
use crate::telemetry::{Telemetry, Transports};
use crate::thermistors::{BatterypackTemperatures, EnvironmentTemperature, ThermistorBank};
use crate::timekeeper::{time_string, TimeKeeper};
use crate::tpms::TpmsScanner;
use crate::updater::Updater;
use crate::util::{ActivationTracker, Interval, Uptime};

/// Everything the controller reaches through a trait, owned by the
/// integrator and handed over once.
pub struct Platform {
    pub mux: Box<dyn AdcMux>,
    pub motors: Box<dyn MotorDriver>,
    pub reference: Box<dyn ReferenceThermometer>,
    pub bms_manager_link: Box<dyn packmon_daly_lib::ByteLink>,
    pub bms_balance_link: Box<dyn packmon_daly_lib::ByteLink>,
    pub radio: Box<dyn LocalRadio>,
    pub websocket: Box<dyn WebsocketLink>,
    pub mqtt: Box<dyn MqttLink>,
    pub network: Box<dyn Network>,
    pub mdns: Box<dyn Mdns>,
    pub webserver: Box<dyn WebServer>,
    pub scanner: Box<dyn BleScanner>,
    pub clock: Box<dyn Clock>,
    pub fetcher: Box<dyn DateHeaderFetcher>,
    pub manifest: Box<dyn OtaManifest>,
    pub watchdog: Box<dyn Watchdog>,
    pub alarm_output: Box<dyn AlarmOutput>,
    pub probe: Box<dyn SystemProbe>,
    pub kv: Rc<dyn KvStore>,
}

/// Platform health: free memory and the reset-reason probe.
struct SystemMonitor {
    probe: Box<dyn SystemProbe>,
    memory_low_bytes: usize,
    bad_reset: bool,
}

impl SystemMonitor {
    fn begin(&mut self) {
        self.bad_reset = self.probe.bad_reset();
        info!(
            "SystemMonitor: reset reason {}, free memory {}",
            self.probe.reset_reason(),
            self.probe.free_memory_bytes()
        );
    }
}

impl Alarmable for SystemMonitor {
    fn collect_alarms(&self, set: &mut AlarmSet) {
        if self.probe.free_memory_bytes() < self.memory_low_bytes {
            set.insert(AlarmKind::SystemMemLow);
        }
        if self.bad_reset {
            set.insert(AlarmKind::SystemBadReset);
        }
    }
}

impl Diagnosticable for SystemMonitor {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        obj.insert(
            "system".to_string(),
            json!({
                "memfree": self.probe.free_memory_bytes(),
                "reset": self.probe.reset_reason(),
            }),
        );
    }
}

pub struct Program {
    config: Config,
    address: String,
    build: String,

    // Platform seams not owned by a single component.
    radio: Box<dyn LocalRadio>,
    websocket: Box<dyn WebsocketLink>,
    mqtt: Box<dyn MqttLink>,
    network: Box<dyn Network>,
    mdns: Box<dyn Mdns>,
    webserver: Box<dyn WebServer>,
    clock: Box<dyn Clock>,
    watchdog: Box<dyn Watchdog>,

    // Components, leaves first.
    calibration: CalibrationManager,
    bank: ThermistorBank,
    batterypack: BatterypackTemperatures,
    environment: EnvironmentTemperature,
    fans: FanController,
    fan_loop: FanLoop,
    bms: BmsManager,
    tpms: TpmsScanner,
    wifi_peers: PeerList,
    mqtt_peers: PeerList,
    timekeeper: TimeKeeper,
    updater: Updater,
    control: ControlManager,
    alarms: AlarmAggregator,
    store: StoreFile,
    telemetry: Telemetry,
    sysmon: SystemMonitor,

    uptime: Uptime,
    cycles: ActivationTracker,
    interval: Interval,
}

impl Program {
    #[must_use]
    pub fn new(config: Config, platform: Platform) -> Self {
        let address: String = platform
            .network
            .mac_address()
            .chars()
            .filter(char::is_ascii_hexdigit)
            .collect();
        let build = build_identifier();

        let calibration = CalibrationManager::new(config.calibration.clone(), platform.reference);
        let bank = ThermistorBank::new(platform.mux);
        let batterypack = BatterypackTemperatures::new(config.batterypack.clone());
        let environment = EnvironmentTemperature::new(config.environment.clone());
        let fans = FanController::new(config.fans.clone(), platform.motors);
        let fan_loop = FanLoop::new(&config.fans);
        let bms = BmsManager::new(&config.bms, platform.bms_manager_link, platform.bms_balance_link);
        let tpms = TpmsScanner::new(config.tpms.clone(), platform.scanner);
        let wifi_peers = PeerList::new(config.wifi_peers.clone());
        let mqtt_peers = PeerList::new(config.mqtt_peers.clone());
        let timekeeper = TimeKeeper::new(config.time.clone(), platform.fetcher, platform.kv.clone());
        let updater = Updater::new(
            config.updater.clone(),
            crate::VERSION,
            &address,
            platform.manifest,
            platform.kv.clone(),
        );
        let control = ControlManager::new(config.control.clone());
        let alarms = AlarmAggregator::new(platform.alarm_output);
        let store = StoreFile::new(config.storage.clone());
        let telemetry = Telemetry::new(config.telemetry.clone(), &address);
        let sysmon = SystemMonitor {
            probe: platform.probe,
            memory_low_bytes: config.memory_low_bytes,
            bad_reset: false,
        };
        let interval = Interval::new(config.program_interval_ms);

        Self {
            config,
            address,
            build,
            radio: platform.radio,
            websocket: platform.websocket,
            mqtt: platform.mqtt,
            network: platform.network,
            mdns: platform.mdns,
            webserver: platform.webserver,
            clock: platform.clock,
            watchdog: platform.watchdog,
            calibration,
            bank,
            batterypack,
            environment,
            fans,
            fan_loop,
            bms,
            tpms,
            wifi_peers,
            mqtt_peers,
            timekeeper,
            updater,
            control,
            alarms,
            store,
            telemetry,
            sysmon,
            uptime: Uptime::default(),
            cycles: ActivationTracker::default(),
            interval,
        }
    }

    /// Initialize external resources, leaves first.
    pub fn begin(&mut self) {
        info!("Program: begin, build {}, addr {}", self.build, self.address);
        self.sysmon.begin();
        self.calibration.begin();
        self.store.begin();
        self.fans.begin();
        self.bms.begin();
        self.timekeeper.begin(self.clock.as_mut());
        self.control.begin(
            self.webserver.as_mut(),
            self.mdns.as_mut(),
            &self.build,
            &self.address,
        );
        match self.wifi_peers.select().and_then(AccessPoint::parse) {
            Some(access_point) => info!("Program: wifi peer '{}'", access_point.ssid),
            None => warn!("Program: no usable wifi peer provisioned"),
        }
        match self.mqtt_peers.select().and_then(BrokerEndpoint::parse) {
            Some(broker) => info!("Program: mqtt peer {}:{}", broker.host, broker.port),
            None => warn!("Program: no usable mqtt peer provisioned"),
        }
    }

    /// One scheduler pass over every component. No I/O here blocks
    /// beyond a few milliseconds; anything longer is broken into steps
    /// that continue next tick.
    pub fn tick(&mut self) {
        self.watchdog.feed();

        // Hardware.
        let bank = &mut self.bank;
        self.calibration.process(&mut |channel| bank.raw(channel));
        self.batterypack.process(&mut self.bank, self.calibration.runtime());
        self.environment.process(&mut self.bank, self.calibration.runtime());
        self.fan_loop
            .process(&mut self.fans, self.batterypack.setpoint(), self.batterypack.current());
        self.bms.process();
        self.tpms.process();

        // Managers.
        let network_up = self.network.available();
        self.wifi_peers.update(network_up);
        self.mqtt_peers.update(self.mqtt.available());
        self.timekeeper.process(self.clock.as_mut(), network_up);
        self.updater.process(self.clock.as_ref(), network_up);

        // Inbound control frames queued by the driver callbacks.
        let mut inbound = self.radio.take_writes();
        inbound.extend(self.websocket.take_messages());
        for action in self.control.process(inbound) {
            match action {
                ControlAction::Calibrate => self.calibration.start_calibration(),
                ControlAction::WipeStorage => self.store.erase(),
            }
        }

        // Alarms: edges observed this tick reflect state of this tick.
        let collected = self.collect_alarm_set();
        self.alarms.process(collected);

        // Telemetry last, so payloads carry this tick's state.
        self.process_telemetry();

        self.cycles.mark();
    }

    /// Run forever at the configured cadence.
    pub fn run(&mut self) {
        loop {
            self.interval.wait();
            self.tick();
        }
    }

    /// Run a bounded number of ticks (sim and tests).
    pub fn run_for(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.interval.wait();
            self.tick();
        }
    }

    fn collect_alarm_set(&self) -> AlarmSet {
        let mut set = AlarmSet::empty();
        self.environment.collect_alarms(&mut set);
        self.batterypack.collect_alarms(&mut set);
        self.telemetry.deliver.collect_alarms(&mut set);
        self.telemetry.publish.collect_alarms(&mut set);
        self.store.collect_alarms(&mut set);
        self.timekeeper.collect_alarms(&mut set);
        self.updater.collect_alarms_at(self.clock.as_ref(), &mut set);
        self.sysmon.collect_alarms(&mut set);
        set
    }

    fn process_telemetry(&mut self) {
        if !self.telemetry.should_process() {
            return;
        }
        let mut transports = Transports {
            radio: self.radio.as_mut(),
            websocket: self.websocket.as_mut(),
            mqtt: self.mqtt.as_mut(),
        };
        let decisions = self.telemetry.decide(&transports, &self.store);

        if decisions.wants_data() {
            let data = collect_data_payload(
                &self.address,
                self.clock.as_ref(),
                &self.bms,
                &self.environment,
                &self.batterypack,
                &self.fans,
                &self.alarms,
            );
            self.telemetry
                .dispatch_data(&decisions, &mut transports, &mut self.store, &data);
        }

        if decisions.wants_diag() {
            let diag = collect_diag_payload(
                &self.address,
                self.clock.as_ref(),
                &self.build,
                &self.uptime,
                &self.cycles,
                &self.interval,
                DiagSources {
                    calibration: &self.calibration,
                    bank: &self.bank,
                    batterypack: &self.batterypack,
                    environment: &self.environment,
                    fans: &self.fans,
                    fan_loop: &self.fan_loop,
                    bms: &self.bms,
                    tpms: &self.tpms,
                    telemetry: &self.telemetry,
                    store: &self.store,
                    control: &self.control,
                    timekeeper: &self.timekeeper,
                    updater: &self.updater,
                    alarms: &self.alarms,
                    sysmon: &self.sysmon,
                },
            );
            self.telemetry.dispatch_diag(&decisions, &mut transports, &diag);
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Payload skeleton shared by `data` and `diag`.
fn payload_base(kind: &str, clock: &dyn Clock, address: &str) -> Map<String, Value> {
    let mut obj = Map::new();
    obj.insert("type".to_string(), json!(kind));
    obj.insert("time".to_string(), json!(time_string(clock.now_epoch().0)));
    obj.insert("addr".to_string(), json!(address));
    obj
}

fn collect_data_payload(
    address: &str,
    clock: &dyn Clock,
    bms: &BmsManager,
    environment: &EnvironmentTemperature,
    batterypack: &BatterypackTemperatures,
    fans: &FanController,
    alarms: &AlarmAggregator,
) -> String {
    let mut obj = payload_base("data", clock, address);
    let instant = bms.instant();
    obj.insert(
        "tmp".to_string(),
        json!({
            "bms": { "V": instant.voltage, "I": instant.current, "C": instant.charge },
            "env": environment.temperature(),
            "bat": {
                "avg": batterypack.avg(),
                "min": batterypack.min(),
                "max": batterypack.max(),
                "val": batterypack.temperatures(),
            },
        }),
    );
    obj.insert("fan".to_string(), json!(fans.duty()));
    obj.insert("alm".to_string(), json!(alarms.to_string()));
    Value::Object(obj).to_string()
}

struct DiagSources<'a> {
    calibration: &'a CalibrationManager,
    bank: &'a ThermistorBank,
    batterypack: &'a BatterypackTemperatures,
    environment: &'a EnvironmentTemperature,
    fans: &'a FanController,
    fan_loop: &'a FanLoop,
    bms: &'a BmsManager,
    tpms: &'a TpmsScanner,
    telemetry: &'a Telemetry,
    store: &'a StoreFile,
    control: &'a ControlManager,
    timekeeper: &'a TimeKeeper,
    updater: &'a Updater,
    alarms: &'a AlarmAggregator,
    sysmon: &'a SystemMonitor,
}

#[allow(clippy::too_many_arguments)]
fn collect_diag_payload(
    address: &str,
    clock: &dyn Clock,
    build: &str,
    uptime: &Uptime,
    cycles: &ActivationTracker,
    interval: &Interval,
    sources: DiagSources<'_>,
) -> String {
    let mut obj = payload_base("diag", clock, address);
    crate::diagnostics::collect_all(
        &[
            sources.calibration,
            sources.bank,
            sources.batterypack,
            sources.environment,
            sources.fans,
            sources.fan_loop,
            sources.bms,
            sources.tpms,
            sources.telemetry,
            sources.store,
            sources.control,
            sources.alarms,
            sources.sysmon,
        ],
        &mut obj,
    );
    // These two stamp wall-clock context into their sections.
    sources.timekeeper.collect_diagnostics(clock, &mut obj);
    sources.updater.collect_diagnostics(clock, &mut obj);
    obj.insert(
        "program".to_string(),
        json!({
            "build": build,
            "uptime": uptime.seconds(),
            "cycles": cycles.count(),
            "delays": interval.exceeded(),
        }),
    );
    Value::Object(obj).to_string()
}
