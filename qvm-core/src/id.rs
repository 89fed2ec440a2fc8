use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Guest-agent socket names are `qga-<id>.sock`; an id with this prefix could
/// collide with another instance's control socket.
const RESERVED_PREFIX: &str = "qga-";

/// Identifies one running instance.
///
/// Socket paths, the tap interface name and the cloud-init `instance-id` are
/// all derived from this value, so it is validated once on construction and
/// never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[non_exhaustive]
pub struct InstanceId(String);

impl InstanceId {
    /// Creates an `InstanceId` after validating its characters.
    ///
    /// Accepts ASCII alphanumerics, `-`, `_` and `.`.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidInstanceId`] if `id` is empty, starts with
    /// `.`, `-` or `qga-`, or contains any other character.
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        let invalid = |reason: &str| CoreError::InvalidInstanceId {
            id: id.clone(),
            reason: reason.to_owned(),
        };

        if id.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if id.starts_with('.') || id.starts_with('-') {
            return Err(invalid("must not start with '.' or '-'"));
        }
        if id.starts_with(RESERVED_PREFIX) {
            return Err(invalid("the 'qga-' prefix is reserved for guest agent sockets"));
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(invalid(&format!("character {c:?} is not allowed")));
        }
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for InstanceId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.0
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[non_exhaustive]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Creates a `MacAddress` from raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Generates a random locally administered unicast address.
    ///
    /// Randomness comes from a v4 UUID; the first octet has the
    /// locally-administered bit set and the multicast bit cleared.
    #[must_use]
    pub fn random() -> Self {
        let bytes = Uuid::new_v4().into_bytes();
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&bytes[..6]);
        octets[0] = (octets[0] | 0x02) & 0xFE;
        Self(octets)
    }

    /// Returns the raw octets.
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Returns `true` if the locally-administered bit is set.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// Returns `true` if the address is unicast.
    #[must_use]
    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidMacAddress { input: s.to_owned() };

        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}
