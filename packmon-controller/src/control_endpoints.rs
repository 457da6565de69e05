//! Inbound control surface: the `/version` endpoint, mDNS service
//! records, and `{"type":...}` frames written over the local radio or
//! websocket.

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::platform::{Mdns, WebServer};
use crate::util::ActivationTrackerWithDetail;
use crate::diagnostics::Diagnosticable;

/// Actions the handlers hand back to the program loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Start a thermistor calibration run.
    Calibrate,
    /// Truncate the telemetry store.
    WipeStorage,
}

/// One routed message type.
pub trait ControlHandler {
    /// Handle a frame already verified to carry `type` and `time`;
    /// returns an optional action for the loop.
    fn handle(&mut self, time: &str, doc: &Value) -> Option<ControlAction>;
}

/// `type: "info"`: free-form status notes from the operator tooling.
#[derive(Default)]
struct InfoHandler;

impl ControlHandler for InfoHandler {
    fn handle(&mut self, time: &str, doc: &Value) -> Option<ControlAction> {
        let content = doc.get("info").and_then(Value::as_str).unwrap_or("(not provided)");
        info!("ControlManager: type=info, time={time}, info='{content}'");
        None
    }
}

/// `type: "ctrl"`: operator commands.
#[derive(Default)]
struct CtrlHandler;

impl ControlHandler for CtrlHandler {
    fn handle(&mut self, time: &str, doc: &Value) -> Option<ControlAction> {
        let content = doc.get("ctrl").and_then(Value::as_str).unwrap_or("(not provided)");
        info!("ControlManager: type=ctrl, time={time}, ctrl='{content}'");
        match content {
            "calibrate" => Some(ControlAction::Calibrate),
            "wipe-storage" => Some(ControlAction::WipeStorage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_version_path")]
    pub version_path: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_ws_port")]
    pub websocket_port: u16,
}

fn default_version_path() -> String {
    "/version".to_string()
}
const fn default_http_port() -> u16 {
    80
}
const fn default_ws_port() -> u16 {
    81
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            version_path: default_version_path(),
            http_port: default_http_port(),
            websocket_port: default_ws_port(),
        }
    }
}

/// Routes inbound frames by their `type` field. Frames are accepted only
/// when they begin with `{"type"`; anything else is counted and dropped.
pub struct ControlManager {
    config: ControlConfig,
    handlers: IndexMap<String, Box<dyn ControlHandler>>,
    failures: ActivationTrackerWithDetail,
}

impl ControlManager {
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        let mut handlers: IndexMap<String, Box<dyn ControlHandler>> = IndexMap::new();
        handlers.insert("ctrl".to_string(), Box::new(CtrlHandler));
        handlers.insert("info".to_string(), Box::new(InfoHandler));
        Self {
            config,
            handlers,
            failures: ActivationTrackerWithDetail::default(),
        }
    }

    /// Publish the build identifier and the discovery records.
    pub fn begin(&mut self, web: &mut dyn WebServer, mdns: &mut dyn Mdns, build: &str, address: &str) {
        web.set_version_body(build);
        mdns.add_service(
            "_http",
            "_tcp",
            self.config.http_port,
            &[
                ("build".to_string(), build.to_string()),
                ("type".to_string(), "PackMonitor".to_string()),
            ],
        );
        mdns.add_service(
            "_ws",
            "_tcp",
            self.config.websocket_port,
            &[
                ("addr".to_string(), address.to_string()),
                ("type".to_string(), "PackMonitor".to_string()),
            ],
        );
        debug!("ControlManager: begin, version at {}", self.config.version_path);
    }

    /// Route one batch of inbound frames; returns the actions requested.
    pub fn process(&mut self, inbound: Vec<String>) -> Vec<ControlAction> {
        let mut actions = Vec::new();
        for message in inbound {
            if !message.starts_with("{\"type\"") {
                self.failures.mark("missing leading type");
                continue;
            }
            let doc: Value = match serde_json::from_str(&message) {
                Ok(doc) => doc,
                Err(fault) => {
                    warn!("ControlManager: frame failed to parse: {fault}");
                    self.failures.mark(fault.to_string());
                    continue;
                }
            };
            let (Some(kind), Some(time)) = (
                doc.get("type").and_then(Value::as_str),
                doc.get("time").and_then(Value::as_str),
            ) else {
                self.failures.mark("missing type or time");
                continue;
            };
            match self.handlers.get_mut(kind) {
                Some(handler) => {
                    if let Some(action) = handler.handle(time, &doc) {
                        actions.push(action);
                    }
                }
                None => self.failures.mark(format!("no handler for '{kind}'")),
            }
        }
        actions
    }
}

impl Diagnosticable for ControlManager {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        obj.insert(
            "control".to_string(),
            json!({
                "failures": { "count": self.failures.count(), "last": self.failures.detail() },
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ControlManager {
        ControlManager::new(ControlConfig::default())
    }

    #[test]
    fn routes_ctrl_frames_to_actions() {
        let mut control = manager();
        let actions = control.process(vec![
            r#"{"type":"ctrl","time":"2025-07-15T10:00:00Z","ctrl":"calibrate"}"#.to_string(),
        ]);
        assert_eq!(actions, vec![ControlAction::Calibrate]);
    }

    #[test]
    fn info_frames_are_accepted_without_action() {
        let mut control = manager();
        let actions = control.process(vec![
            r#"{"type":"info","time":"2025-07-15T10:00:00Z","info":"hello"}"#.to_string(),
        ]);
        assert!(actions.is_empty());
        assert_eq!(control.failures.count(), 0);
    }

    #[test]
    fn frames_must_lead_with_type() {
        let mut control = manager();
        control.process(vec![r#"{"time":"x","type":"ctrl"}"#.to_string()]);
        assert_eq!(control.failures.count(), 1);
    }

    #[test]
    fn unknown_type_and_missing_time_are_counted() {
        let mut control = manager();
        control.process(vec![
            r#"{"type":"bogus","time":"2025-07-15T10:00:00Z"}"#.to_string(),
            r#"{"type":"ctrl"}"#.to_string(),
            "not json at all".to_string(),
        ]);
        assert_eq!(control.failures.count(), 3);
    }
}
