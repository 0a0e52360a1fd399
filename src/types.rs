//! Shared identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 64-bit LoRaWAN device EUI, kept as 16 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DevEui(String);

/// Rejected device EUI text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid device EUI {0:?}: expected 16 hex digits")]
pub struct InvalidDevEui(pub String);

impl DevEui {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DevEui {
    type Err = InvalidDevEui;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != ':')
            .collect::<String>()
            .to_ascii_lowercase();
        if cleaned.len() == 16 && cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(cleaned))
        } else {
            Err(InvalidDevEui(s.to_string()))
        }
    }
}

impl TryFrom<String> for DevEui {
    type Error = InvalidDevEui;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DevEui> for String {
    fn from(eui: DevEui) -> Self {
        eui.0
    }
}

impl fmt::Display for DevEui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
