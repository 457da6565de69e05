//! Newline-delimited telemetry store with a byte cap: a ring by
//! truncation. Buffers payloads while connectivity is down; drained
//! line-by-line on reconnect.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::alarms::{Alarmable, AlarmKind, AlarmSet};
use crate::util::{round2, ActivationTracker, ActivationTrackerWithDetail};
use crate::diagnostics::Diagnosticable;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreFileConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,
    /// Byte cap; an append that would exceed it erases the file first.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    /// STORE_SIZE raises when the remaining share drops below this
    /// percentage.
    #[serde(default = "default_remain_limit")]
    pub remain_limit_pct: f32,
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u64,
}

fn default_path() -> PathBuf {
    PathBuf::from("data.log")
}
const fn default_capacity() -> u64 {
    1024 * 1024
}
const fn default_remain_limit() -> f32 {
    20.0
}
const fn default_failure_limit() -> u64 {
    3
}

impl Default for StoreFileConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            capacity: default_capacity(),
            remain_limit_pct: default_remain_limit(),
            failure_limit: default_failure_limit(),
        }
    }
}

pub struct StoreFile {
    config: StoreFileConfig,
    size: u64,
    available: bool,
    appends: ActivationTrackerWithDetail,
    failures: ActivationTracker,
    erasures: ActivationTracker,
}

impl StoreFile {
    #[must_use]
    pub fn new(config: StoreFileConfig) -> Self {
        Self {
            config,
            size: 0,
            available: false,
            appends: ActivationTrackerWithDetail::default(),
            failures: ActivationTracker::default(),
            erasures: ActivationTracker::default(),
        }
    }

    pub fn begin(&mut self) {
        self.size = std::fs::metadata(&self.config.path).map_or(0, |meta| meta.len());
        self.available = true;
        debug!("StoreFile[{}]: begin, size={}", self.config.path.display(), self.size);
    }

    #[must_use]
    pub fn available(&self) -> bool {
        self.available
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Remaining capacity as a percentage.
    #[must_use]
    pub fn remains(&self) -> f32 {
        if self.config.capacity == 0 {
            return 0.0;
        }
        round2(self.config.capacity.saturating_sub(self.size) as f32 * 100.0 / self.config.capacity as f32)
    }

    /// Append one line (a newline is added). Wraps by erasing when the
    /// write would exceed the capacity. File handles are reopened on each
    /// attempt, so a transient failure recovers on the next call.
    pub fn append(&mut self, data: &str) -> bool {
        let write_len = data.len() as u64 + 1;
        if self.size + write_len > self.config.capacity {
            debug!("StoreFile[{}]: wrapping at size={}", self.config.path.display(), self.size);
            self.erase();
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)
            .and_then(|mut file| {
                file.write_all(data.as_bytes())?;
                file.write_all(b"\n")?;
                file.flush()
            });
        match result {
            Ok(()) => {
                self.size += write_len;
                self.appends.mark(write_len.to_string());
                self.failures.clear();
                true
            }
            Err(fault) => {
                warn!("StoreFile[{}]: append failed: {fault}", self.config.path.display());
                self.failures.mark();
                false
            }
        }
    }

    /// Visit every stored line; the callback returning false aborts the
    /// read and is reported to the caller (the file is left untouched).
    pub fn for_each_line(&mut self, callback: &mut dyn FnMut(&str) -> bool) -> bool {
        let file = match File::open(&self.config.path) {
            Ok(file) => file,
            // Nothing stored yet reads as an empty file.
            Err(fault) if fault.kind() == std::io::ErrorKind::NotFound => return true,
            Err(fault) => {
                warn!("StoreFile[{}]: read failed: {fault}", self.config.path.display());
                self.failures.mark();
                return false;
            }
        };
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else {
                self.failures.mark();
                return false;
            };
            if !callback(&line) {
                return false;
            }
        }
        true
    }

    pub fn erase(&mut self) {
        debug!("StoreFile[{}]: erase, size={}", self.config.path.display(), self.size);
        if let Err(fault) = std::fs::remove_file(&self.config.path) {
            if fault.kind() != std::io::ErrorKind::NotFound {
                warn!("StoreFile[{}]: erase failed: {fault}", self.config.path.display());
                self.failures.mark();
            }
        }
        self.size = 0;
        self.erasures.mark();
    }
}

impl Diagnosticable for StoreFile {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
        obj.insert(
            "storage".to_string(),
            json!({
                "size": self.size,
                "remains": self.remains(),
                "critical": self.config.remain_limit_pct,
                "appends": self.appends.count(),
                "failures": self.failures.count(),
                "erasures": self.erasures.count(),
            }),
        );
    }
}

impl Alarmable for StoreFile {
    fn collect_alarms(&self, set: &mut AlarmSet) {
        if self.failures.count() > self.config.failure_limit {
            set.insert(AlarmKind::StoreFail);
        }
        if self.remains() < self.config.remain_limit_pct {
            set.insert(AlarmKind::StoreSize);
        }
    }
}
