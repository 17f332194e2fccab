//! Active network state, as reported by whoever triggers a refresh.
//!
//! The refresher never probes interfaces itself. The caller tells it whether
//! a network is up and whether it is Wi-Fi, which gates both whether a batch
//! runs at all and whether Wi-Fi-only feeds (and a Wi-Fi-only proxy) apply.

use std::fmt;
use std::str::FromStr;

/// Class of the active network connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkClass {
    Wifi,
    Other,
}

/// Snapshot of connectivity at the moment a batch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Disconnected,
    Connected(NetworkClass),
}

impl NetworkState {
    pub fn is_connected(self) -> bool {
        matches!(self, NetworkState::Connected(_))
    }

    pub fn is_wifi(self) -> bool {
        matches!(self, NetworkState::Connected(NetworkClass::Wifi))
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkState::Disconnected => f.write_str("offline"),
            NetworkState::Connected(NetworkClass::Wifi) => f.write_str("wifi"),
            NetworkState::Connected(NetworkClass::Other) => f.write_str("other"),
        }
    }
}

impl FromStr for NetworkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wifi" => Ok(NetworkState::Connected(NetworkClass::Wifi)),
            "other" | "mobile" => Ok(NetworkState::Connected(NetworkClass::Other)),
            "offline" | "none" => Ok(NetworkState::Disconnected),
            other => Err(format!("unknown network state '{other}' (wifi, other, offline)")),
        }
    }
}
