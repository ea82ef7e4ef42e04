//! User identity and topic access levels.

use serde::{Deserialize, Serialize};

/// Minimal user descriptor resolved from a session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
        }
    }
}

/// Access level a user holds on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum AccessType {
    Invited = -2,
    Denied = -1,
    View = 0,
    Read = 1,
    Write = 2,
}

impl AccessType {
    /// Whether fan-out may deliver to a holder of this level.
    pub fn can_receive(self) -> bool {
        self != AccessType::Denied
    }
}

impl From<AccessType> for i8 {
    fn from(a: AccessType) -> i8 {
        a as i8
    }
}

impl TryFrom<i8> for AccessType {
    type Error = String;
    fn try_from(v: i8) -> Result<Self, String> {
        match v {
            -2 => Ok(Self::Invited),
            -1 => Ok(Self::Denied),
            0 => Ok(Self::View),
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            other => Err(format!("unknown access type: {other}")),
        }
    }
}
