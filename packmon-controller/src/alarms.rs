//! Alarm aggregation: declarative predicates over subsystems, edge
//! detection, one output line.

use enumset::{EnumSet, EnumSetType};
use log::info;
use serde_json::{json, Map, Value};

use crate::platform::AlarmOutput;
use crate::util::ActivationTracker;
use crate::diagnostics::Diagnosticable;

/// The fixed alarm enumeration; bit order is part of the telemetry
/// contract.
#[derive(EnumSetType, Debug)]
pub enum AlarmKind {
    TimeSync,
    TimeDrift,
    TempFail,
    TempMin,
    TempWarn,
    TempMax,
    StoreFail,
    StoreSize,
    PublishFail,
    PublishSize,
    DeliverFail,
    DeliverSize,
    UpdateVers,
    UpdateLong,
    SystemMemLow,
    SystemBadReset,
}

pub const ALARM_COUNT: usize = 16;

impl AlarmKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::TimeSync => "TIME_SYNC",
            Self::TimeDrift => "TIME_DRIFT",
            Self::TempFail => "TEMP_FAIL",
            Self::TempMin => "TEMP_MIN",
            Self::TempWarn => "TEMP_WARN",
            Self::TempMax => "TEMP_MAX",
            Self::StoreFail => "STORE_FAIL",
            Self::StoreSize => "STORE_SIZE",
            Self::PublishFail => "PUBLISH_FAIL",
            Self::PublishSize => "PUBLISH_SIZE",
            Self::DeliverFail => "DELIVER_FAIL",
            Self::DeliverSize => "DELIVER_SIZE",
            Self::UpdateVers => "UPDATE_VERS",
            Self::UpdateLong => "UPDATE_LONG",
            Self::SystemMemLow => "SYSTEM_MEMLOW",
            Self::SystemBadReset => "SYSTEM_BADRESET",
        }
    }
}

pub type AlarmSet = EnumSet<AlarmKind>;

/// Comma-joined names of the set bits.
#[must_use]
pub fn alarms_to_string(set: AlarmSet) -> String {
    set.iter().map(AlarmKind::name).collect::<Vec<_>>().join(",")
}

/// A subsystem that contributes alarms.
pub trait Alarmable {
    fn collect_alarms(&self, set: &mut AlarmSet);
}

/// Rebuilds the alarm set each tick, XORs against the previous set to
/// find edges, and drives the output line. Alarms never latch: a cleared
/// predicate clears the bit on the next tick.
pub struct AlarmAggregator {
    output: Box<dyn AlarmOutput>,
    current: AlarmSet,
    activations: [ActivationTracker; ALARM_COUNT],
    deactivations: [ActivationTracker; ALARM_COUNT],
}

impl AlarmAggregator {
    #[must_use]
    pub fn new(output: Box<dyn AlarmOutput>) -> Self {
        Self {
            output,
            current: AlarmSet::empty(),
            activations: std::array::from_fn(|_| ActivationTracker::default()),
            deactivations: std::array::from_fn(|_| ActivationTracker::default()),
        }
    }

    pub fn process(&mut self, collected: AlarmSet) {
        let changes = collected ^ self.current;
        if changes.is_empty() {
            return;
        }
        for kind in changes {
            if collected.contains(kind) {
                self.activations[kind as usize].mark();
            } else {
                self.deactivations[kind as usize].mark();
            }
        }
        self.output.set(!collected.is_empty());
        info!(
            "AlarmAggregator: alarms: [{}] <-- [{}]",
            alarms_to_string(collected),
            alarms_to_string(self.current)
        );
        self.current = collected;
    }

    #[must_use]
    pub fn current(&self) -> AlarmSet {
        self.current
    }
}

impl std::fmt::Display for AlarmAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&alarms_to_string(self.current))
    }
}

impl Diagnosticable for AlarmAggregator {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        let mut sub = Map::new();
        for kind in AlarmSet::all() {
            let active = self.current.contains(kind);
            let count = self.activations[kind as usize].count();
            if active || count > 0 {
                let since = if active {
                    self.activations[kind as usize].last_secs()
                } else {
                    self.deactivations[kind as usize].last_secs()
                };
                sub.insert(
                    kind.name().to_string(),
                    json!({ "now": u8::from(active), "for": since, "cnt": count }),
                );
            }
        }
        obj.insert("alarms".to_string(), Value::Object(sub));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct PinSpy {
        states: Rc<RefCell<Vec<bool>>>,
    }

    impl AlarmOutput for PinSpy {
        fn set(&mut self, active: bool) {
            self.states.borrow_mut().push(active);
        }
    }

    fn aggregator() -> (AlarmAggregator, Rc<RefCell<Vec<bool>>>) {
        let states = Rc::new(RefCell::new(Vec::new()));
        let spy = PinSpy { states: states.clone() };
        (AlarmAggregator::new(Box::new(spy)), states)
    }

    #[test]
    fn output_follows_any_bit_set() {
        let (mut aggregator, states) = aggregator();
        aggregator.process(AlarmKind::TempWarn.into());
        assert_eq!(*states.borrow(), vec![true]);
        // Unchanged set: no edge, no pin write.
        aggregator.process(AlarmKind::TempWarn.into());
        assert_eq!(states.borrow().len(), 1);
        // Cleared predicate clears the line; nothing latches.
        aggregator.process(AlarmSet::empty());
        assert_eq!(*states.borrow(), vec![true, false]);
    }

    #[test]
    fn edges_increment_activation_counters() {
        let (mut aggregator, _) = aggregator();
        aggregator.process(AlarmKind::StoreFail | AlarmKind::TimeSync);
        aggregator.process(AlarmKind::StoreFail.into());
        aggregator.process(AlarmKind::StoreFail | AlarmKind::TimeSync);
        assert_eq!(aggregator.activations[AlarmKind::TimeSync as usize].count(), 2);
        assert_eq!(aggregator.deactivations[AlarmKind::TimeSync as usize].count(), 1);
        assert_eq!(aggregator.activations[AlarmKind::StoreFail as usize].count(), 1);
    }

    #[test]
    fn names_join_in_bit_order() {
        let set = AlarmKind::TimeDrift | AlarmKind::TempMax | AlarmKind::SystemBadReset;
        assert_eq!(alarms_to_string(set), "TIME_DRIFT,TEMP_MAX,SYSTEM_BADRESET");
    }
}
