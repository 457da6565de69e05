//! Wall-clock synchronisation: HTTP `Date:` header fetches, drift
//! estimation, and persisted drift replay between fetches.

use std::rc::Rc;

use chrono::DateTime;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::alarms::{Alarmable, AlarmKind, AlarmSet};
use crate::kv::{KvStore, PersistentValue};
use crate::platform::{Clock, DateHeaderFetcher};
use crate::util::{ActivationTracker, ActivationTrackerWithDetail, Interval};

/// Drift clamp, milliseconds per hour.
const DRIFT_MAX_MS_PER_HOUR: i64 = 60 * 1000;
const MS_PER_HOUR: i64 = 60 * 60 * 1000;

/// ISO-8601 UTC timestamp of `epoch_secs`.
#[must_use]
pub fn time_string(epoch_secs: i64) -> String {
    DateTime::from_timestamp(epoch_secs, 0)
        .map(|datetime| datetime.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

/// Parse an RFC-1123 `Date:` header ("Tue, 15 Jul 2025 10:00:00 GMT").
#[must_use]
pub fn parse_date_header(header: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(header).ok().map(|datetime| datetime.timestamp())
}

/// Exponentially blended clock-drift estimate in ms/hour, clamped to
/// ±60 000 with the excursion remembered for the TIME_DRIFT alarm.
#[derive(Debug)]
pub struct DriftEstimator {
    drift_ms_per_hour: i64,
    high_drift: bool,
}

impl DriftEstimator {
    #[must_use]
    pub fn new(drift_ms_per_hour: i64) -> Self {
        Self {
            drift_ms_per_hour,
            high_drift: false,
        }
    }

    /// Blend the drift observed over one fetch interval: 75% old, 25%
    /// new.
    pub fn update(&mut self, period_secs: i64, period_ms: u64) -> i64 {
        if period_ms == 0 {
            return self.drift_ms_per_hour;
        }
        let observed = ((period_secs * 1000 - period_ms as i64) * MS_PER_HOUR) / period_ms as i64;
        let blended = (self.drift_ms_per_hour * 3 + observed) / 4;
        if blended.abs() > DRIFT_MAX_MS_PER_HOUR {
            self.high_drift = true;
        }
        self.drift_ms_per_hour = blended.clamp(-DRIFT_MAX_MS_PER_HOUR, DRIFT_MAX_MS_PER_HOUR);
        debug!("DriftEstimator: drift={} ms/h", self.drift_ms_per_hour);
        self.drift_ms_per_hour
    }

    /// Pro-rate the drift over `period_ms` and apply it to an epoch
    /// timestamp with microsecond carry/borrow. Returns the adjustment in
    /// milliseconds.
    pub fn apply(&self, secs: &mut i64, micros: &mut i64, period_ms: u64) -> i64 {
        let adjust_ms = self.drift_ms_per_hour * period_ms as i64 / MS_PER_HOUR;
        *secs += adjust_ms / 1000;
        *micros += (adjust_ms % 1000) * 1000;
        if *micros >= 1_000_000 {
            *secs += *micros / 1_000_000;
            *micros %= 1_000_000;
        } else if *micros < 0 {
            *secs -= 1 + (-*micros / 1_000_000);
            *micros = 1_000_000 - (-*micros % 1_000_000);
        }
        adjust_ms
    }

    #[must_use]
    pub fn drift(&self) -> i64 {
        self.drift_ms_per_hour
    }

    #[must_use]
    pub fn high_drift(&self) -> bool {
        self.high_drift
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeKeeperConfig {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_useragent")]
    pub useragent: String,
    #[serde(default = "default_interval_update")]
    pub interval_update_ms: u64,
    #[serde(default = "default_interval_adjust")]
    pub interval_adjust_ms: u64,
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u64,
}

fn default_server() -> String {
    "http://www.google.com".to_string()
}
fn default_useragent() -> String {
    "packmon/1.0".to_string()
}
const fn default_interval_update() -> u64 {
    60 * 60 * 1000
}
const fn default_interval_adjust() -> u64 {
    60 * 1000
}
const fn default_failure_limit() -> u64 {
    3
}

impl Default for TimeKeeperConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            useragent: default_useragent(),
            interval_update_ms: default_interval_update(),
            interval_adjust_ms: default_interval_adjust(),
            failure_limit: default_failure_limit(),
        }
    }
}

/// Keeps the wall clock synchronised across power cycles: fetch on
/// `interval_update` while the network is up, replay persisted drift on
/// `interval_adjust`, re-seed the clock from the persisted epoch at boot.
pub struct TimeKeeper {
    config: TimeKeeperConfig,
    fetcher: Box<dyn DateHeaderFetcher>,
    drifter: DriftEstimator,
    persistent_drift: PersistentValue<i32>,
    persistent_time: PersistentValue<u32>,
    fetched_time: i64,
    interval_update: Interval,
    interval_adjust: Interval,
    fetches: ActivationTrackerWithDetail,
    failures: ActivationTracker,
}

impl TimeKeeper {
    #[must_use]
    pub fn new(config: TimeKeeperConfig, fetcher: Box<dyn DateHeaderFetcher>, store: Rc<dyn KvStore>) -> Self {
        let persistent_drift = PersistentValue::<i32>::new(store.clone(), "nettime", "drift", 0);
        let persistent_time = PersistentValue::<u32>::new(store, "nettime", "time", 0);
        let drifter = DriftEstimator::new(i64::from(persistent_drift.get()));
        let interval_update = Interval::new(config.interval_update_ms);
        let interval_adjust = Interval::new(config.interval_adjust_ms);
        Self {
            config,
            fetcher,
            drifter,
            persistent_drift,
            persistent_time,
            fetched_time: 0,
            interval_update,
            interval_adjust,
            fetches: ActivationTrackerWithDetail::default(),
            failures: ActivationTracker::default(),
        }
    }

    /// Re-seed the clock from the persisted epoch so power cycles keep
    /// roughly monotonic wall time.
    pub fn begin(&mut self, clock: &mut dyn Clock) {
        let persisted = self.persistent_time.get();
        if persisted > 0 {
            clock.set_epoch(i64::from(persisted), 0);
        }
        info!(
            "TimeKeeper: begin, persisted time={persisted}, drift={} ms/h, now={}",
            self.drifter.drift(),
            time_string(clock.now_epoch().0)
        );
    }

    pub fn process(&mut self, clock: &mut dyn Clock, network_available: bool) {
        let mut elapsed_ms = 0;

        if network_available && self.interval_update.passed(&mut elapsed_ms, true) {
            match self
                .fetcher
                .fetch(&self.config.server, &self.config.useragent)
                .as_deref()
                .and_then(parse_date_header)
            {
                Some(fetched) if fetched > 0 => {
                    self.fetches.mark(fetched.to_string());
                    clock.set_epoch(fetched, 0);
                    if self.fetched_time > 0 {
                        let drift = self.drifter.update(fetched - self.fetched_time, elapsed_ms);
                        self.persistent_drift.set(&(drift as i32));
                    }
                    self.fetched_time = fetched;
                    self.persistent_time.set(&(fetched as u32));
                    self.failures.clear();
                    info!("TimeKeeper: time={}", time_string(fetched));
                }
                _ => {
                    self.failures.mark();
                    warn!("TimeKeeper: fetch failed ({} consecutive)", self.failures.count());
                }
            }
        }

        if self.interval_adjust.passed(&mut elapsed_ms, false) {
            let (mut secs, mut micros) = clock.now_epoch();
            let adjust_ms = self.drifter.apply(&mut secs, &mut micros, elapsed_ms);
            if adjust_ms != 0 {
                clock.set_epoch(secs, micros);
                self.persistent_time.set(&(secs as u32));
                debug!("TimeKeeper: adjusted {adjust_ms} ms");
            }
        }
    }

    pub fn collect_diagnostics(&self, clock: &dyn Clock, obj: &mut Map<String, Value>) {
        obj.insert(
            "time".to_string(),
            json!({
                "now": time_string(clock.now_epoch().0),
                "drift": self.drifter.drift(),
                "highdrift": self.drifter.high_drift(),
                "fetches": self.fetches.count(),
                "failures": self.failures.count(),
            }),
        );
    }
}

impl Alarmable for TimeKeeper {
    fn collect_alarms(&self, set: &mut AlarmSet) {
        if self.failures.count() > self.config.failure_limit {
            set.insert(AlarmKind::TimeSync);
        }
        if self.drifter.high_drift() {
            set.insert(AlarmKind::TimeDrift);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[test]
    fn parses_rfc1123_date_header() {
        let epoch = parse_date_header("Tue, 15 Jul 2025 10:00:00 GMT").expect("parses");
        assert_eq!(time_string(epoch), "2025-07-15T10:00:00Z");
        assert_eq!(parse_date_header("not a date"), None);
    }

    #[test]
    fn drift_blends_75_25() {
        let mut drifter = DriftEstimator::new(1000);
        // Observed: 10 elapsed wall seconds over 9 measured seconds ->
        // (10000 - 9000) * 3_600_000 / 9000 = 400_000 ms/h, blended then
        // clamped.
        let drift = drifter.update(10, 9_000);
        assert_eq!(drift, DRIFT_MAX_MS_PER_HOUR);
        assert!(drifter.high_drift());
    }

    #[test]
    fn drift_of_small_skew_stays_unclamped() {
        let mut drifter = DriftEstimator::new(0);
        // One extra second over an hour: 3600s wall vs 3599s measured.
        let drift = drifter.update(3600, 3_599_000);
        // observed ~ 1000.3 ms/h, blended to a quarter.
        assert_eq!(drift, 250);
        assert!(!drifter.high_drift());
    }

    #[test]
    fn apply_adds_prorated_drift_with_carry() {
        // +3600 ms/h over 60 s is exactly +60 ms.
        let drifter = DriftEstimator::new(3600);
        let (mut secs, mut micros) = (1000, 0);
        let adjust = drifter.apply(&mut secs, &mut micros, 60_000);
        assert_eq!(adjust, 60);
        assert_eq!((secs, micros), (1000, 60_000));

        // Carry across the second boundary.
        let (mut secs, mut micros) = (1000, 980_000);
        drifter.apply(&mut secs, &mut micros, 60_000);
        assert_eq!((secs, micros), (1001, 40_000));
    }

    #[test]
    fn apply_borrows_on_negative_drift() {
        let drifter = DriftEstimator::new(-3600);
        let (mut secs, mut micros) = (1000, 20_000);
        let adjust = drifter.apply(&mut secs, &mut micros, 60_000);
        assert_eq!(adjust, -60);
        assert_eq!((secs, micros), (999, 960_000));
    }

    struct FixedClock {
        secs: i64,
        micros: i64,
    }

    impl Clock for FixedClock {
        fn now_epoch(&self) -> (i64, i64) {
            (self.secs, self.micros)
        }
        fn set_epoch(&mut self, secs: i64, micros: i64) {
            self.secs = secs;
            self.micros = micros;
        }
    }

    struct HeaderStub {
        header: Option<String>,
    }

    impl DateHeaderFetcher for HeaderStub {
        fn fetch(&mut self, _url: &str, _useragent: &str) -> Option<String> {
            self.header.clone()
        }
    }

    #[test]
    fn begin_reseeds_clock_from_persisted_epoch() {
        let store: Rc<dyn KvStore> = Rc::new(MemoryKv::new());
        store.set_u32("nettime", "time", 1_750_000_000);
        let mut keeper = TimeKeeper::new(
            TimeKeeperConfig::default(),
            Box::new(HeaderStub { header: None }),
            store,
        );
        let mut clock = FixedClock { secs: 0, micros: 0 };
        keeper.begin(&mut clock);
        assert_eq!(clock.secs, 1_750_000_000);
    }

    #[test]
    fn successful_fetch_sets_clock_and_persists() {
        let store: Rc<dyn KvStore> = Rc::new(MemoryKv::new());
        let mut keeper = TimeKeeper::new(
            TimeKeeperConfig::default(),
            Box::new(HeaderStub {
                header: Some("Tue, 15 Jul 2025 10:00:00 GMT".to_string()),
            }),
            store.clone(),
        );
        let mut clock = FixedClock { secs: 0, micros: 0 };
        // interval_update fires at start.
        keeper.process(&mut clock, true);
        let expected = parse_date_header("Tue, 15 Jul 2025 10:00:00 GMT").unwrap();
        assert_eq!(clock.secs, expected);
        assert_eq!(store.get_u32("nettime", "time"), Some(expected as u32));
    }

    #[test]
    fn failures_beyond_limit_raise_time_sync() {
        let store: Rc<dyn KvStore> = Rc::new(MemoryKv::new());
        let config = TimeKeeperConfig {
            interval_update_ms: 0,
            failure_limit: 2,
            ..TimeKeeperConfig::default()
        };
        let mut keeper = TimeKeeper::new(config, Box::new(HeaderStub { header: None }), store);
        let mut clock = FixedClock { secs: 0, micros: 0 };
        for _ in 0..3 {
            // A zero-length interval refires on every call once time has
            // moved at all; at minimum the at-start pass counts.
            keeper.process(&mut clock, true);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let mut set = AlarmSet::empty();
        keeper.collect_alarms(&mut set);
        assert!(set.contains(AlarmKind::TimeSync));
        // No fetch while the network is down.
        let before = keeper.failures.count();
        keeper.process(&mut clock, false);
        assert_eq!(keeper.failures.count(), before);
    }
}
