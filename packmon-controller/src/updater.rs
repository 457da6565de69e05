//! Periodic OTA-manifest polling. The download/flash machinery is the
//! platform's; this component only asks "is there something newer" on a
//! wall-time cadence that survives power cycles.

use std::rc::Rc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::alarms::{Alarmable, AlarmKind, AlarmSet};
use crate::kv::{KvStore, PersistentValue};
use crate::platform::{Clock, OtaManifest};
use crate::timekeeper::time_string;

/// Append `?k=v&k=v` query parameters to a URL.
#[must_use]
pub fn encode_url_with_params(url: &str, params: &[(&str, &str)]) -> String {
    let mut result = String::from(url);
    for (index, (key, value)) in params.iter().enumerate() {
        result.push(if index == 0 { '?' } else { '&' });
        result.push_str(key);
        result.push('=');
        result.push_str(value);
    }
    result
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    #[serde(default = "default_json")]
    pub json: String,
    #[serde(default = "default_build_type")]
    pub build_type: String,
    #[serde(default = "default_interval_check")]
    pub interval_check_ms: u64,
    #[serde(default = "default_interval_long")]
    pub interval_long_ms: u64,
}

fn default_json() -> String {
    "http://ota.local:8090/images/images.json".to_string()
}
fn default_build_type() -> String {
    "packmon-esp32s3".to_string()
}
const fn default_interval_check() -> u64 {
    24 * 60 * 60 * 1000
}
const fn default_interval_long() -> u64 {
    28 * 24 * 60 * 60 * 1000
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            json: default_json(),
            build_type: default_build_type(),
            interval_check_ms: default_interval_check(),
            interval_long_ms: default_interval_long(),
        }
    }
}

/// Wall-time gate persisted across reboots: a day-scale cadence must not
/// restart from zero on every power cycle.
struct PersistentInterval {
    interval_ms: u64,
    previous: PersistentValue<u32>,
}

impl PersistentInterval {
    fn ready(&mut self, clock: &dyn Clock) -> bool {
        let now = clock.now_epoch().0;
        let previous = i64::from(self.previous.get());
        if now > 0 && now - previous > (self.interval_ms / 1000) as i64 {
            self.previous.set(&(now as u32));
            return true;
        }
        false
    }

    /// Milliseconds since the last completed check, zero when unknown.
    fn elapsed_ms(&self, clock: &dyn Clock) -> u64 {
        let now = clock.now_epoch().0;
        let previous = i64::from(self.previous.get());
        if now > 0 && previous > 0 && now > previous {
            (now - previous) as u64 * 1000
        } else {
            0
        }
    }
}

pub struct Updater {
    config: UpdaterConfig,
    version: String,
    address: String,
    checker: Box<dyn OtaManifest>,
    interval: PersistentInterval,
    newer: PersistentValue<String>,
    available: bool,
    checks: u64,
}

impl Updater {
    #[must_use]
    pub fn new(
        config: UpdaterConfig,
        version: impl Into<String>,
        address: impl Into<String>,
        checker: Box<dyn OtaManifest>,
        store: Rc<dyn KvStore>,
    ) -> Self {
        let previous = PersistentValue::<u32>::new(store.clone(), "updates", "previous", 0);
        let newer = PersistentValue::<String>::new(store, "updates", "version", String::new());
        let available = !newer.get().is_empty();
        let interval = PersistentInterval {
            interval_ms: config.interval_check_ms,
            previous,
        };
        Self {
            config,
            version: version.into(),
            address: address.into(),
            checker,
            interval,
            newer,
            available,
            checks: 0,
        }
    }

    pub fn process(&mut self, clock: &dyn Clock, network_available: bool) {
        if !network_available || !self.interval.ready(clock) {
            return;
        }
        self.checks += 1;
        let url = encode_url_with_params(
            &self.config.json,
            &[
                ("type", &self.config.build_type),
                ("vers", &self.version),
                ("addr", &self.address),
            ],
        );
        debug!("Updater: checking {url}");
        let version = self.checker.newer_version(&url).unwrap_or_default();
        if self.newer.get() != version {
            self.newer.set(&version);
            self.available = !version.is_empty();
            if self.available {
                info!("Updater: newer version available: {version}");
            }
        }
    }

    /// True when no successful check has happened for the long interval.
    #[must_use]
    pub fn too_long(&self, clock: &dyn Clock) -> bool {
        self.interval.elapsed_ms(clock) > self.config.interval_long_ms
    }

    #[must_use]
    pub fn update_available(&self) -> bool {
        self.available
    }

    pub fn collect_diagnostics(&self, clock: &dyn Clock, obj: &mut Map<String, Value>) {
        let mut sub = Map::new();
        sub.insert("current".to_string(), json!(self.version));
        if self.available {
            sub.insert("available".to_string(), json!(self.newer.get()));
        }
        let previous = self.interval.previous.get();
        if previous > 0 {
            sub.insert("checked".to_string(), json!(time_string(i64::from(previous))));
        }
        obj.insert("updates".to_string(), Value::Object(sub));
    }

    /// The aggregator cannot take `&dyn Clock` through `Alarmable`, so
    /// the program snapshots this pair each tick.
    pub fn collect_alarms_at(&self, clock: &dyn Clock, set: &mut AlarmSet) {
        if self.available {
            set.insert(AlarmKind::UpdateVers);
        }
        if self.too_long(clock) {
            set.insert(AlarmKind::UpdateLong);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use std::cell::Cell;

    struct FixedClock {
        secs: i64,
    }

    impl Clock for FixedClock {
        fn now_epoch(&self) -> (i64, i64) {
            (self.secs, 0)
        }
        fn set_epoch(&mut self, secs: i64, _micros: i64) {
            self.secs = secs;
        }
    }

    struct ManifestStub {
        answer: Option<String>,
        seen_url: Cell<Option<String>>,
    }

    impl OtaManifest for ManifestStub {
        fn newer_version(&mut self, url: &str) -> Option<String> {
            self.seen_url.set(Some(url.to_string()));
            self.answer.clone()
        }
    }

    fn updater(store: Rc<dyn KvStore>, answer: Option<&str>) -> Updater {
        Updater::new(
            UpdaterConfig::default(),
            "1.5.0",
            "246f28aabbcc",
            Box::new(ManifestStub {
                answer: answer.map(ToString::to_string),
                seen_url: Cell::new(None),
            }),
            store,
        )
    }

    #[test]
    fn url_carries_type_vers_addr() {
        assert_eq!(
            encode_url_with_params("http://x/images.json", &[("type", "t"), ("vers", "v"), ("addr", "a")]),
            "http://x/images.json?type=t&vers=v&addr=a"
        );
    }

    #[test]
    fn newer_version_persists_and_raises_alarm() {
        let store: Rc<dyn KvStore> = Rc::new(MemoryKv::new());
        let mut updater = updater(store.clone(), Some("1.6.0"));
        let clock = FixedClock { secs: 1_750_000_000 };
        updater.process(&clock, true);
        assert!(updater.update_available());
        assert_eq!(store.get_string("updates", "version"), Some("1.6.0".to_string()));
        assert_eq!(store.get_u32("updates", "previous"), Some(1_750_000_000));

        let mut set = AlarmSet::empty();
        updater.collect_alarms_at(&clock, &mut set);
        assert!(set.contains(AlarmKind::UpdateVers));
    }

    #[test]
    fn available_flag_survives_reconstruction() {
        let store: Rc<dyn KvStore> = Rc::new(MemoryKv::new());
        store.set_string("updates", "version", "1.6.0");
        let updater = updater(store, None);
        assert!(updater.update_available());
    }

    #[test]
    fn check_is_gated_by_persisted_wall_time() {
        let store: Rc<dyn KvStore> = Rc::new(MemoryKv::new());
        let mut updater = updater(store.clone(), None);
        let clock = FixedClock { secs: 1_750_000_000 };
        updater.process(&clock, true);
        assert_eq!(updater.checks, 1);
        // Within the day-long window nothing fires, even across what
        // would be a reboot.
        updater.process(&clock, true);
        assert_eq!(updater.checks, 1);
        let later = FixedClock { secs: 1_750_000_000 + 90_000 };
        updater.process(&later, true);
        assert_eq!(updater.checks, 2);
    }

    #[test]
    fn stale_checks_raise_update_long() {
        let store: Rc<dyn KvStore> = Rc::new(MemoryKv::new());
        store.set_u32("updates", "previous", 1_000_000);
        let updater = updater(store, None);
        let clock = FixedClock { secs: 1_000_000 + 29 * 24 * 60 * 60 };
        let mut set = AlarmSet::empty();
        updater.collect_alarms_at(&clock, &mut set);
        assert!(set.contains(AlarmKind::UpdateLong));
    }

    #[test]
    fn offline_skips_the_check() {
        let store: Rc<dyn KvStore> = Rc::new(MemoryKv::new());
        let mut updater = updater(store, Some("1.6.0"));
        let clock = FixedClock { secs: 1_750_000_000 };
        updater.process(&clock, false);
        assert!(!updater.update_available());
        assert_eq!(updater.checks, 0);
    }
}
