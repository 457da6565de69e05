//! Telemetry fan-out: deliver (radio → websocket → MQTT), publish
//! (MQTT only), MTU-aware payload splitting and the periodic
//! orchestration with store-and-forward draining.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::alarms::{Alarmable, AlarmKind, AlarmSet};
use crate::json_split::JsonSplitter;
use crate::platform::{LocalRadio, MqttLink, WebsocketLink};
use crate::storage::StoreFile;
use crate::util::{ActivationTracker, ActivationTrackerWithDetail, Interval};
use crate::diagnostics::Diagnosticable;

/// Keys re-prefixed into every fragment of a split payload.
const COMMON_KEYS: [&str; 3] = ["type", "time", "addr"];
/// Pause between fragments so slow links keep up.
const FRAGMENT_PACING_MS: u64 = 20;
/// GATT notification overhead subtracted from the negotiated MTU.
const BLE_MTU_OVERHEAD: usize = 3;

/// The outbound links, borrowed for one orchestration pass.
pub struct Transports<'a> {
    pub radio: &'a mut dyn LocalRadio,
    pub websocket: &'a mut dyn WebsocketLink,
    pub mqtt: &'a mut dyn MqttLink,
}

/// Send `data`, splitting into fragments when it exceeds `max_payload`.
/// Fragments that still exceed the budget are sent anyway but recorded;
/// the caller surfaces them through the SIZE alarms.
fn send_bounded(
    send: &mut dyn FnMut(&str) -> bool,
    data: &str,
    max_payload: Option<usize>,
    exceeded: &mut ActivationTrackerWithDetail,
) -> bool {
    let Some(max_payload) = max_payload else {
        return send(data);
    };
    if data.len() <= max_payload {
        return send(data);
    }
    let splitter = JsonSplitter::new(max_payload, &COMMON_KEYS);
    let mut ok = true;
    splitter.split(data, &mut |fragment, elements| {
        debug!(
            "telemetry: fragment, data={}, part={}, elements={elements}",
            data.len(),
            fragment.len()
        );
        if !send(fragment) {
            ok = false;
        }
        if fragment.len() > max_payload {
            exceeded.mark(fragment.len().to_string());
            ok = false;
        }
        std::thread::sleep(std::time::Duration::from_millis(FRAGMENT_PACING_MS));
    });
    ok
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverConfig {
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u64,
}

fn default_topic() -> String {
    "packmon".to_string()
}
const fn default_failure_limit() -> u64 {
    3
}

impl Default for DeliverConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            failure_limit: default_failure_limit(),
        }
    }
}

/// Immediate delivery to whoever is listening, in fixed precedence:
/// local radio, then websocket, then MQTT. The MQTT leg is skipped when
/// the capture path is about to publish the same payload.
pub struct Deliver {
    config: DeliverConfig,
    id: String,
    delivers: ActivationTrackerWithDetail,
    failures: ActivationTracker,
    payload_exceeded: ActivationTrackerWithDetail,
}

impl Deliver {
    #[must_use]
    pub fn new(config: DeliverConfig, id: impl Into<String>) -> Self {
        Self {
            config,
            id: id.into(),
            delivers: ActivationTrackerWithDetail::default(),
            failures: ActivationTracker::default(),
            payload_exceeded: ActivationTrackerWithDetail::default(),
        }
    }

    #[must_use]
    pub fn available(&self, transports: &Transports<'_>) -> bool {
        transports.radio.available() || transports.websocket.available() || transports.mqtt.available()
    }

    pub fn deliver(
        &mut self,
        transports: &mut Transports<'_>,
        data: &str,
        kind: &str,
        will_publish_via_mqtt: bool,
    ) -> bool {
        let delivered = self.try_radio(transports, data)
            || self.try_websocket(transports, data)
            || will_publish_via_mqtt
            || self.try_mqtt(transports, data, kind);
        if delivered {
            self.delivers.mark(data.len().to_string());
            self.failures.clear();
        } else {
            self.failures.mark();
        }
        delivered
    }

    fn try_radio(&mut self, transports: &mut Transports<'_>, data: &str) -> bool {
        if !transports.radio.available() {
            return false;
        }
        let max_payload = transports.radio.mtu().saturating_sub(BLE_MTU_OVERHEAD);
        let radio = &mut *transports.radio;
        send_bounded(&mut |part| radio.send(part), data, Some(max_payload), &mut self.payload_exceeded)
    }

    fn try_websocket(&mut self, transports: &mut Transports<'_>, data: &str) -> bool {
        transports.websocket.available() && transports.websocket.send(data)
    }

    fn try_mqtt(&mut self, transports: &mut Transports<'_>, data: &str, kind: &str) -> bool {
        if !transports.mqtt.available() {
            return false;
        }
        let topic = format!("{}/{}/{kind}", self.config.topic, self.id);
        let max_payload = transports.mqtt.buffer_size();
        let mqtt = &mut *transports.mqtt;
        send_bounded(
            &mut |part| mqtt.publish(&topic, part),
            data,
            Some(max_payload),
            &mut self.payload_exceeded,
        )
    }
}

impl Diagnosticable for Deliver {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        obj.insert(
            "deliver".to_string(),
            json!({
                "delivers": self.delivers.count(),
                "failures": { "count": self.failures.count(), "limit": self.config.failure_limit },
            }),
        );
    }
}

impl Alarmable for Deliver {
    fn collect_alarms(&self, set: &mut AlarmSet) {
        if self.failures.count() > self.config.failure_limit {
            set.insert(AlarmKind::DeliverFail);
        }
        if self.payload_exceeded.any() {
            set.insert(AlarmKind::DeliverSize);
        }
    }
}

/// Broker-bound publishing on `topic/<id>/<kind>`.
pub struct Publish {
    config: DeliverConfig,
    id: String,
    publishes: ActivationTrackerWithDetail,
    failures: ActivationTracker,
    payload_exceeded: ActivationTrackerWithDetail,
}

impl Publish {
    #[must_use]
    pub fn new(config: DeliverConfig, id: impl Into<String>) -> Self {
        Self {
            config,
            id: id.into(),
            publishes: ActivationTrackerWithDetail::default(),
            failures: ActivationTracker::default(),
            payload_exceeded: ActivationTrackerWithDetail::default(),
        }
    }

    #[must_use]
    pub fn available(&self, mqtt: &dyn MqttLink) -> bool {
        mqtt.available()
    }

    pub fn publish(&mut self, mqtt: &mut dyn MqttLink, data: &str, kind: &str) -> bool {
        let topic = format!("{}/{}/{kind}", self.config.topic, self.id);
        let max_payload = mqtt.buffer_size();
        let ok = send_bounded(
            &mut |part| mqtt.publish(&topic, part),
            data,
            Some(max_payload),
            &mut self.payload_exceeded,
        );
        if ok {
            self.publishes.mark(data.len().to_string());
            self.failures.clear();
        } else {
            self.failures.mark();
        }
        ok
    }
}

impl Diagnosticable for Publish {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        obj.insert(
            "publish".to_string(),
            json!({
                "publishes": self.publishes.count(),
                "failures": { "count": self.failures.count(), "limit": self.config.failure_limit },
            }),
        );
    }
}

impl Alarmable for Publish {
    fn collect_alarms(&self, set: &mut AlarmSet) {
        if self.failures.count() > self.config.failure_limit {
            set.insert(AlarmKind::PublishFail);
        }
        if self.payload_exceeded.any() {
            set.insert(AlarmKind::PublishSize);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub deliver: DeliverConfig,
    #[serde(default)]
    pub publish: DeliverConfig,
    #[serde(default = "default_enabled")]
    pub data_publish_enabled: bool,
    #[serde(default = "default_enabled")]
    pub data_storage_enabled: bool,
    #[serde(default = "default_enabled")]
    pub diag_deliver_enabled: bool,
    #[serde(default = "default_enabled")]
    pub diag_publish_enabled: bool,
    #[serde(default = "default_process_ms")]
    pub process_ms: u64,
    #[serde(default = "default_deliver_ms")]
    pub deliver_ms: u64,
    #[serde(default = "default_capture_ms")]
    pub capture_ms: u64,
    #[serde(default = "default_diagnose_ms")]
    pub diagnose_ms: u64,
}

const fn default_enabled() -> bool {
    true
}
const fn default_process_ms() -> u64 {
    5 * 1000
}
const fn default_deliver_ms() -> u64 {
    5 * 1000
}
const fn default_capture_ms() -> u64 {
    15 * 1000
}
const fn default_diagnose_ms() -> u64 {
    60 * 1000
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            deliver: DeliverConfig::default(),
            publish: DeliverConfig::default(),
            data_publish_enabled: true,
            data_storage_enabled: true,
            diag_deliver_enabled: true,
            diag_publish_enabled: true,
            process_ms: default_process_ms(),
            deliver_ms: default_deliver_ms(),
            capture_ms: default_capture_ms(),
            diagnose_ms: default_diagnose_ms(),
        }
    }
}

/// What this orchestration pass should do. Deliver, capture and diagnose
/// run on independent intervals inside the process gate.
#[derive(Debug, Default, Clone, Copy)]
pub struct Decisions {
    pub deliver: bool,
    pub capture_publish: bool,
    pub capture_store: bool,
    pub diag_deliver: bool,
    pub diag_publish: bool,
    /// True when the capture leg will publish, letting delivery skip its
    /// MQTT fallback.
    pub will_publish: bool,
}

impl Decisions {
    #[must_use]
    pub fn wants_data(&self) -> bool {
        self.deliver || self.capture_publish || self.capture_store
    }

    #[must_use]
    pub fn wants_diag(&self) -> bool {
        self.diag_deliver || self.diag_publish
    }
}

/// Periodic snapshot routing: one process gate, three independent
/// cadences.
pub struct Telemetry {
    config: TelemetryConfig,
    pub deliver: Deliver,
    pub publish: Publish,
    process_interval: Interval,
    deliver_interval: Interval,
    capture_interval: Interval,
    diagnose_interval: Interval,
}

impl Telemetry {
    #[must_use]
    pub fn new(config: TelemetryConfig, id: &str) -> Self {
        let deliver = Deliver::new(config.deliver.clone(), id);
        let publish = Publish::new(config.publish.clone(), id);
        let process_interval = Interval::new(config.process_ms);
        let deliver_interval = Interval::new(config.deliver_ms);
        let capture_interval = Interval::new(config.capture_ms);
        let diagnose_interval = Interval::new(config.diagnose_ms);
        Self {
            config,
            deliver,
            publish,
            process_interval,
            deliver_interval,
            capture_interval,
            diagnose_interval,
        }
    }

    /// The process gate; when it fires, the per-leg intervals decide what
    /// actually happens this pass.
    pub fn should_process(&mut self) -> bool {
        self.process_interval.ready()
    }

    pub fn decide(&mut self, transports: &Transports<'_>, store: &StoreFile) -> Decisions {
        let should_deliver = self.deliver_interval.ready();
        let should_capture = self.capture_interval.ready();
        let should_diagnose =
            self.diagnose_interval.ready() && (self.config.diag_deliver_enabled || self.config.diag_publish_enabled);

        let publish_up = self.publish.available(transports.mqtt);
        let decisions = Decisions {
            deliver: should_deliver && self.deliver.available(transports),
            capture_publish: should_capture && self.config.data_publish_enabled && publish_up,
            capture_store: should_capture && self.config.data_storage_enabled && store.available(),
            diag_deliver: should_diagnose && self.config.diag_deliver_enabled && self.deliver.available(transports),
            diag_publish: should_diagnose && self.config.diag_publish_enabled && publish_up,
            will_publish: self.config.data_publish_enabled && publish_up,
        };
        debug!(
            "Telemetry: deliver={}/{}, capture={}/{}/{}, diagnose={}/{}/{}",
            should_deliver,
            decisions.deliver,
            should_capture,
            decisions.capture_publish,
            decisions.capture_store,
            should_diagnose,
            decisions.diag_deliver,
            decisions.diag_publish
        );
        decisions
    }

    pub fn dispatch_data(
        &mut self,
        decisions: &Decisions,
        transports: &mut Transports<'_>,
        store: &mut StoreFile,
        data: &str,
    ) {
        if decisions.deliver {
            self.deliver.deliver(transports, data, "data", decisions.will_publish);
        }
        if decisions.capture_publish || decisions.capture_store {
            self.capture(decisions, transports, store, data);
        }
    }

    pub fn dispatch_diag(&mut self, decisions: &Decisions, transports: &mut Transports<'_>, diag: &str) {
        if decisions.diag_deliver {
            self.deliver.deliver(transports, diag, "diag", decisions.will_publish);
        }
        if decisions.diag_publish {
            self.publish.publish(transports.mqtt, diag, "diag");
        }
    }

    /// Capture: while publishing is possible, first drain anything the
    /// store buffered (a failed line aborts the drain and leaves the file
    /// for the next pass), then publish the fresh payload, falling back
    /// to the store.
    fn capture(&mut self, decisions: &Decisions, transports: &mut Transports<'_>, store: &mut StoreFile, data: &str) {
        if decisions.capture_publish {
            if store.available() && store.size() > 0 {
                debug!("Telemetry: draining {} stored bytes", store.size());
                let publish = &mut self.publish;
                let mqtt = &mut *transports.mqtt;
                let drained = store
                    .for_each_line(&mut |line| line.is_empty() || publish.publish(mqtt, line, "data"));
                if drained {
                    store.erase();
                } else {
                    warn!("Telemetry: store drain aborted, will retry");
                }
            }
            if !self.publish.publish(transports.mqtt, data, "data") && decisions.capture_store {
                store.append(data);
            }
        } else if decisions.capture_store {
            store.append(data);
        }
    }
}

impl Diagnosticable for Telemetry {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        self.deliver.collect_diagnostics(obj);
        self.publish.collect_diagnostics(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreFileConfig;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct RadioStub {
        up: bool,
        sent: Vec<String>,
    }

    impl LocalRadio for RadioStub {
        fn available(&self) -> bool {
            self.up
        }
        fn mtu(&self) -> usize {
            512
        }
        fn send(&mut self, data: &str) -> bool {
            self.sent.push(data.to_string());
            true
        }
        fn take_writes(&mut self) -> Vec<String> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct WebsocketStub {
        up: bool,
        sent: Vec<String>,
    }

    impl WebsocketLink for WebsocketStub {
        fn available(&self) -> bool {
            self.up
        }
        fn send(&mut self, data: &str) -> bool {
            self.sent.push(data.to_string());
            true
        }
        fn take_messages(&mut self) -> Vec<String> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct MqttStub {
        up: bool,
        refuse: bool,
        refuse_after: Option<usize>,
        published: Rc<RefCell<Vec<(String, String)>>>,
    }

    impl MqttLink for MqttStub {
        fn available(&self) -> bool {
            self.up
        }
        fn publish(&mut self, topic: &str, data: &str) -> bool {
            if self.refuse {
                return false;
            }
            if let Some(limit) = self.refuse_after {
                if self.published.borrow().len() >= limit {
                    return false;
                }
            }
            self.published.borrow_mut().push((topic.to_string(), data.to_string()));
            true
        }
        fn buffer_size(&self) -> usize {
            3 * 1024
        }
    }

    fn links(radio_up: bool, ws_up: bool, mqtt_up: bool) -> (RadioStub, WebsocketStub, MqttStub) {
        (
            RadioStub { up: radio_up, ..Default::default() },
            WebsocketStub { up: ws_up, ..Default::default() },
            MqttStub { up: mqtt_up, ..Default::default() },
        )
    }

    #[test]
    fn deliver_precedence_radio_first() {
        let (mut radio, mut websocket, mut mqtt) = links(true, true, true);
        let mut deliver = Deliver::new(DeliverConfig::default(), "aabbcc");
        let mut transports = Transports {
            radio: &mut radio,
            websocket: &mut websocket,
            mqtt: &mut mqtt,
        };
        assert!(deliver.deliver(&mut transports, "{\"type\":\"data\"}", "data", false));
        assert_eq!(radio.sent.len(), 1);
        assert!(websocket.sent.is_empty());
        assert!(mqtt.published.borrow().is_empty());
    }

    #[test]
    fn deliver_skips_mqtt_when_capture_will_publish() {
        // Radio down, websocket up: delivery succeeds via websocket and
        // the MQTT leg is never invoked.
        let (mut radio, mut websocket, mut mqtt) = links(false, true, true);
        let mut deliver = Deliver::new(DeliverConfig::default(), "aabbcc");
        let mut transports = Transports {
            radio: &mut radio,
            websocket: &mut websocket,
            mqtt: &mut mqtt,
        };
        assert!(deliver.deliver(&mut transports, "{}", "data", true));
        assert_eq!(websocket.sent.len(), 1);
        assert!(mqtt.published.borrow().is_empty());

        // Websocket also down but capture will publish: counted as
        // delivered without touching MQTT.
        websocket.up = false;
        let mut transports = Transports {
            radio: &mut radio,
            websocket: &mut websocket,
            mqtt: &mut mqtt,
        };
        assert!(deliver.deliver(&mut transports, "{}", "data", true));
        assert!(mqtt.published.borrow().is_empty());
    }

    #[test]
    fn deliver_total_failure_counts_toward_alarm() {
        let (mut radio, mut websocket, mut mqtt) = links(false, false, false);
        let config = DeliverConfig { failure_limit: 1, ..DeliverConfig::default() };
        let mut deliver = Deliver::new(config, "aabbcc");
        for _ in 0..2 {
            let mut transports = Transports {
                radio: &mut radio,
                websocket: &mut websocket,
                mqtt: &mut mqtt,
            };
            assert!(!deliver.deliver(&mut transports, "{}", "data", false));
        }
        let mut set = AlarmSet::empty();
        deliver.collect_alarms(&mut set);
        assert!(set.contains(AlarmKind::DeliverFail));
    }

    #[test]
    fn publish_uses_topic_id_kind() {
        let (_, _, mut mqtt) = links(false, false, true);
        let mut publish = Publish::new(DeliverConfig::default(), "aabbcc");
        assert!(publish.publish(&mut mqtt, "{}", "data"));
        assert_eq!(mqtt.published.borrow()[0].0, "packmon/aabbcc/data");
    }

    fn telemetry_fixture(dir: &tempfile::TempDir) -> (Telemetry, StoreFile) {
        let mut store = StoreFile::new(StoreFileConfig {
            path: dir.path().join("data.log"),
            capacity: 16 * 1024,
            ..StoreFileConfig::default()
        });
        store.begin();
        (Telemetry::new(TelemetryConfig::default(), "aabbcc"), store)
    }

    #[test]
    fn capture_falls_back_to_store_when_publish_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut telemetry, mut store) = telemetry_fixture(&dir);
        let (mut radio, mut websocket, mut mqtt) = links(false, false, true);
        mqtt.refuse = true;
        let mut transports = Transports {
            radio: &mut radio,
            websocket: &mut websocket,
            mqtt: &mut mqtt,
        };
        let decisions = Decisions {
            capture_publish: true,
            capture_store: true,
            ..Decisions::default()
        };
        telemetry.dispatch_data(&decisions, &mut transports, &mut store, r#"{"n":1}"#);
        assert!(store.size() > 0, "refused publish must be buffered");
    }

    #[test]
    fn drain_publishes_backlog_before_fresh_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut telemetry, mut store) = telemetry_fixture(&dir);
        store.append(r#"{"n":1}"#);
        store.append(r#"{"n":2}"#);

        let (mut radio, mut websocket, mut mqtt) = links(false, false, true);
        let published = mqtt.published.clone();
        let mut transports = Transports {
            radio: &mut radio,
            websocket: &mut websocket,
            mqtt: &mut mqtt,
        };
        let decisions = Decisions {
            capture_publish: true,
            capture_store: true,
            ..Decisions::default()
        };
        telemetry.dispatch_data(&decisions, &mut transports, &mut store, r#"{"n":3}"#);

        let published = published.borrow();
        let bodies: Vec<&str> = published.iter().map(|(_, body)| body.as_str()).collect();
        assert_eq!(bodies, vec![r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#]);
        assert_eq!(store.size(), 0, "drained store is erased");
    }

    #[test]
    fn failed_drain_keeps_store_for_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut telemetry, mut store) = telemetry_fixture(&dir);
        store.append(r#"{"n":1}"#);
        store.append(r#"{"n":2}"#);
        let stored = store.size();

        let (mut radio, mut websocket, mut mqtt) = links(false, false, true);
        mqtt.refuse_after = Some(1);
        let mut transports = Transports {
            radio: &mut radio,
            websocket: &mut websocket,
            mqtt: &mut mqtt,
        };
        let decisions = Decisions {
            capture_publish: true,
            capture_store: true,
            ..Decisions::default()
        };
        telemetry.dispatch_data(&decisions, &mut transports, &mut store, r#"{"n":3}"#);
        // Drain aborted at the second stored line; the file survives and
        // the fresh payload was appended after its failed publish.
        assert!(store.size() >= stored);
    }
}
