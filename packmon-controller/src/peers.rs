//! Round-robin peer rotation with a retry budget, used for Wi-Fi and
//! MQTT peer lists.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerConfig {
    pub order: Vec<String>,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

const fn default_retries() -> u32 {
    3
}

/// Cursor over a fixed peer list: failures beyond the retry budget
/// advance to the next peer; any success resets the budget without
/// advancing.
#[derive(Debug)]
pub struct PeerList {
    config: PeerConfig,
    current: usize,
    attempts: u32,
}

impl PeerList {
    #[must_use]
    pub fn new(config: PeerConfig) -> Self {
        Self {
            config,
            current: 0,
            attempts: 0,
        }
    }

    #[must_use]
    pub fn available(&self) -> bool {
        !self.config.order.is_empty()
    }

    #[must_use]
    pub fn select(&self) -> Option<&str> {
        self.config.order.get(self.current).map(String::as_str)
    }

    pub fn update(&mut self, connected: bool) {
        if self.config.order.is_empty() {
            return;
        }
        if connected {
            self.attempts = 0;
        } else {
            self.attempts += 1;
            if self.attempts > self.config.retries {
                self.attempts = 0;
                self.current = (self.current + 1) % self.config.order.len();
            }
        }
    }

    #[must_use]
    pub fn cursor(&self) -> usize {
        self.current
    }
}

/// `host:port/user@pass` broker endpoint, as provisioned in the peer
/// list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

impl BrokerEndpoint {
    #[must_use]
    pub fn parse(peer: &str) -> Option<Self> {
        let (address, credentials) = peer.split_once('/').unwrap_or((peer, ""));
        let (host, port) = match address.split_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (address, 1883),
        };
        if host.is_empty() {
            return None;
        }
        let (user, pass) = credentials.split_once('@').unwrap_or((credentials, ""));
        Some(Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            pass: pass.to_string(),
        })
    }
}

/// `ssid:pass` access-point credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub pass: String,
}

impl AccessPoint {
    #[must_use]
    pub fn parse(peer: &str) -> Option<Self> {
        let (ssid, pass) = peer.split_once(':').unwrap_or((peer, ""));
        if ssid.is_empty() {
            return None;
        }
        Some(Self {
            ssid: ssid.to_string(),
            pass: pass.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(order: &[&str], retries: u32) -> PeerList {
        PeerList::new(PeerConfig {
            order: order.iter().map(ToString::to_string).collect(),
            retries,
        })
    }

    #[test]
    fn advances_after_exhausting_retry_budget() {
        let mut list = peers(&["a", "b", "c"], 3);
        assert_eq!(list.select(), Some("a"));
        // retries + 1 consecutive failures advance by exactly one.
        for _ in 0..3 {
            list.update(false);
            assert_eq!(list.cursor(), 0);
        }
        list.update(false);
        assert_eq!(list.cursor(), 1);
        assert_eq!(list.select(), Some("b"));
    }

    #[test]
    fn success_resets_attempts_without_advancing() {
        let mut list = peers(&["a", "b"], 2);
        list.update(false);
        list.update(false);
        list.update(true);
        assert_eq!(list.cursor(), 0);
        // Budget starts over after the success.
        list.update(false);
        list.update(false);
        assert_eq!(list.cursor(), 0);
        list.update(false);
        assert_eq!(list.cursor(), 1);
    }

    #[test]
    fn cursor_wraps_modulo_length() {
        let mut list = peers(&["a", "b"], 0);
        list.update(false);
        assert_eq!(list.select(), Some("b"));
        list.update(false);
        assert_eq!(list.select(), Some("a"));
    }

    #[test]
    fn empty_list_is_unavailable() {
        let mut list = peers(&[], 0);
        assert!(!list.available());
        assert_eq!(list.select(), None);
        // Failure updates on an empty list are a no-op.
        list.update(false);
        list.update(false);
        assert_eq!(list.cursor(), 0);
    }

    #[test]
    fn broker_endpoint_parsing() {
        assert_eq!(
            BrokerEndpoint::parse("mqtt.local:1883/user@pass"),
            Some(BrokerEndpoint {
                host: "mqtt.local".to_string(),
                port: 1883,
                user: "user".to_string(),
                pass: "pass".to_string(),
            })
        );
        let bare = BrokerEndpoint::parse("mqtt.in.the.cloud").expect("host only");
        assert_eq!(bare.port, 1883);
        assert!(bare.user.is_empty());
        assert_eq!(BrokerEndpoint::parse(":1883"), None);
    }

    #[test]
    fn access_point_parsing() {
        assert_eq!(
            AccessPoint::parse("ssid:pass"),
            Some(AccessPoint {
                ssid: "ssid".to_string(),
                pass: "pass".to_string(),
            })
        );
        // Open networks carry no password separator.
        let open = AccessPoint::parse("_Heathrow Wi-Fi").expect("open network");
        assert!(open.pass.is_empty());
    }
}
