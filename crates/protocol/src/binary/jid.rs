//! Addresses of users, groups and individual devices.
//!
//! A JID has the textual form `user[:device]@server`. Device-qualified JIDs
//! identify one client instance of a user; each such instance owns its own
//! cryptographic session, addressed by a [`DeviceAddress`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Server for phone-number users.
pub const USER_SERVER: &str = "s.whatsapp.net";
/// Server for groups.
pub const GROUP_SERVER: &str = "g.us";
/// Server for broadcast lists and status.
pub const BROADCAST_SERVER: &str = "broadcast";
/// Server for privacy-preserving linked identities.
pub const LID_SERVER: &str = "lid";
/// Server for newsletters.
pub const NEWSLETTER_SERVER: &str = "newsletter";

/// Domain byte used by the compact device address encoding.
pub(crate) fn domain_type(server: &str) -> Option<u8> {
    match server {
        USER_SERVER => Some(0),
        LID_SERVER => Some(1),
        _ => None,
    }
}

pub(crate) fn server_for_domain(domain: u8) -> Option<&'static str> {
    match domain {
        0 => Some(USER_SERVER),
        1 => Some(LID_SERVER),
        _ => None,
    }
}

/// A parsed address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Jid {
    /// User part; empty for server-only addresses.
    pub user: String,
    /// Device index, when the address names one device.
    pub device: Option<u16>,
    /// Server part.
    pub server: String,
}

impl Jid {
    /// Creates a user-level address.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device: None,
            server: server.into(),
        }
    }

    /// Creates a device-qualified address.
    pub fn with_device(user: impl Into<String>, device: u16, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device: Some(device),
            server: server.into(),
        }
    }

    /// Parses `user[:device]@server` or a bare server.
    pub fn parse(value: &str) -> Option<Self> {
        let Some((local, server)) = value.split_once('@') else {
            if value.is_empty() || value.contains(':') {
                return None;
            }
            return Some(Self::new("", value));
        };
        if server.is_empty() || server.contains('@') {
            return None;
        }
        let (user, device) = match local.split_once(':') {
            Some((user, device)) => {
                if device.is_empty() || !device.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                (user, Some(device.parse::<u16>().ok()?))
            }
            None => (local, None),
        };
        Some(Self {
            user: user.to_string(),
            device,
            server: server.to_string(),
        })
    }

    /// True for group addresses.
    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    /// True for broadcast list and status addresses.
    pub fn is_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER
    }

    /// True for individual users, on either user server.
    pub fn is_user(&self) -> bool {
        !self.user.is_empty() && (self.server == USER_SERVER || self.server == LID_SERVER)
    }

    /// Returns the user-level address with any device index removed.
    pub fn to_non_device(&self) -> Jid {
        Jid::new(self.user.clone(), self.server.clone())
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() && self.device.is_none() {
            return write!(f, "{}", self.server);
        }
        write!(f, "{}", self.user)?;
        if let Some(device) = self.device {
            write!(f, ":{device}")?;
        }
        write!(f, "@{}", self.server)
    }
}

impl FromStr for Jid {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::parse(s).ok_or_else(|| ProtocolError::Deserialization(format!("invalid jid: {s}")))
    }
}

/// Session key: one user identity plus one device index.
///
/// Linked-identity users get a `_1` suffix on the name so their sessions
/// never collide with phone-number sessions of the same digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    /// Stable user identifier.
    pub name: String,
    /// Device index; 0 is the primary device.
    pub device: u16,
}

const LID_SUFFIX: &str = "_1";

impl DeviceAddress {
    /// Creates an address from parts.
    pub fn new(name: impl Into<String>, device: u16) -> Self {
        Self {
            name: name.into(),
            device,
        }
    }

    /// Derives the session address of a (possibly device-less) user JID.
    pub fn from_jid(jid: &Jid) -> Self {
        let name = if jid.server == LID_SERVER {
            format!("{}{}", jid.user, LID_SUFFIX)
        } else {
            jid.user.clone()
        };
        Self {
            name,
            device: jid.device.unwrap_or(0),
        }
    }

    /// Reverses [`DeviceAddress::from_jid`].
    pub fn to_jid(&self) -> Jid {
        match self.name.strip_suffix(LID_SUFFIX) {
            Some(user) => Jid::with_device(user, self.device, LID_SERVER),
            None => Jid::with_device(self.name.clone(), self.device, USER_SERVER),
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device)
    }
}

impl FromStr for DeviceAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::Deserialization(format!("invalid device address: {s}"));
        let (name, device) = s.rsplit_once('.').ok_or_else(invalid)?;
        if name.is_empty() {
            return Err(invalid());
        }
        let device = device.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(name, device))
    }
}
