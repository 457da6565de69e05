//! The two Daly BMS units: one managing pack protection, one balancing.
//! Each session exclusively owns its serial link; polling runs on three
//! cadences (instant / status / diagnostics).

use log::{debug, trace};
use packmon_daly_lib::{ByteLink, Session};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::util::Interval;
use crate::diagnostics::Diagnosticable;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmsConfig {
    #[serde(default = "default_interval_instant")]
    pub interval_instant_ms: u64,
    #[serde(default = "default_interval_status")]
    pub interval_status_ms: u64,
    #[serde(default = "default_interval_diagnostics")]
    pub interval_diagnostics_ms: u64,
}

const fn default_interval_instant() -> u64 {
    15 * 1000
}
const fn default_interval_status() -> u64 {
    60 * 1000
}
const fn default_interval_diagnostics() -> u64 {
    5 * 60 * 1000
}

impl Default for BmsConfig {
    fn default() -> Self {
        Self {
            interval_instant_ms: default_interval_instant(),
            interval_status_ms: default_interval_status(),
            interval_diagnostics_ms: default_interval_diagnostics(),
        }
    }
}

/// Pack essentials for the periodic telemetry payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct Instant {
    pub voltage: f32,
    pub current: f32,
    pub charge: f32,
}

pub struct BmsManager {
    manager: Session<Box<dyn ByteLink>>,
    balance: Session<Box<dyn ByteLink>>,
    interval_instant: Interval,
    interval_status: Interval,
    interval_diagnostics: Interval,
}

impl BmsManager {
    #[must_use]
    pub fn new(config: &BmsConfig, manager_link: Box<dyn ByteLink>, balance_link: Box<dyn ByteLink>) -> Self {
        let mut manager = Session::new("manager", manager_link);
        manager.set_listener(Box::new(|frame| trace!("BmsManager[manager]: tx {frame}")));
        let mut balance = Session::new("balance", balance_link);
        balance.set_listener(Box::new(|frame| trace!("BmsManager[balance]: tx {frame}")));
        Self {
            manager,
            balance,
            interval_instant: Interval::new(config.interval_instant_ms),
            interval_status: Interval::new(config.interval_status_ms),
            interval_diagnostics: Interval::new(config.interval_diagnostics_ms),
        }
    }

    pub fn begin(&mut self) {
        self.manager.begin();
        self.balance.begin();
    }

    pub fn process(&mut self) {
        if self.interval_instant.ready() {
            self.manager.request_instant();
            self.balance.request_instant();
        }
        if self.interval_status.ready() {
            self.manager.request_status();
            self.balance.request_status();
        }
        if self.interval_diagnostics.ready() {
            self.manager.request_diagnostics();
            self.balance.request_diagnostics();
        }
        for session in [&mut self.manager, &mut self.balance] {
            for command in session.process() {
                debug!("BmsManager[{}]: completed 0x{command:02X}", session.id());
            }
        }
    }

    /// Live pack snapshot from the managing unit.
    #[must_use]
    pub fn instant(&self) -> Instant {
        self.manager
            .status
            .pack
            .get()
            .map_or_else(Instant::default, |pack| Instant {
                voltage: pack.voltage_v,
                current: pack.current_a,
                charge: pack.soc_pct,
            })
    }

    #[must_use]
    pub fn manager(&self) -> &Session<Box<dyn ByteLink>> {
        &self.manager
    }

    #[must_use]
    pub fn balance(&self) -> &Session<Box<dyn ByteLink>> {
        &self.balance
    }

    /// Charge/discharge enables and reset go to the managing unit only.
    pub fn set_charge_mosfet(&mut self, on: bool) {
        self.manager.set_charge_mosfet(on);
    }

    pub fn set_discharge_mosfet(&mut self, on: bool) {
        self.manager.set_discharge_mosfet(on);
    }

    pub fn send_reset(&mut self) {
        self.manager.send_reset();
    }
}

impl Diagnosticable for BmsManager {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        let mut sub = Map::new();
        for session in [&self.manager, &self.balance] {
            let status = &session.status;
            let mut entry = Map::new();
            entry.insert(
                "link".to_string(),
                json!({
                    "sent": session.counters.frames_sent,
                    "received": session.counters.frames_received,
                    "unhandled": session.counters.frames_unhandled,
                }),
            );
            if let Some(pack) = status.pack.get() {
                entry.insert(
                    "pack".to_string(),
                    json!({ "V": pack.voltage_v, "I": pack.current_a, "C": pack.soc_pct }),
                );
            }
            if let Some(failures) = status.failures.get() {
                entry.insert(
                    "failures".to_string(),
                    json!({ "count": failures.count, "active": failures.active() }),
                );
            }
            if let Some(info) = status.info.get() {
                entry.insert(
                    "info".to_string(),
                    json!({ "cells": info.cells, "sensors": info.sensors, "cycles": info.cycles }),
                );
            }
            sub.insert(session.id().to_string(), Value::Object(entry));
        }
        obj.insert("bms".to_string(), Value::Object(sub));
    }
}
