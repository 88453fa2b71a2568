//! Handles and handle types.
//!
//! A handle is a small non-zero integer standing in for a protocol
//! identifier (a contact, a room, a contact list or a user-defined group).
//! The integer `0` is reserved and means "no handle".

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TpError, TpResult};

/// An interned identifier. `Handle::NONE` (zero) means "absent".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u32);

impl Handle {
    /// The reserved "no handle" value.
    pub const NONE: Handle = Handle(0);

    /// Wraps a raw handle value as received from a client.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw integer.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns true for the reserved zero handle.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Handle {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of entity a handle (or a channel's target) refers to.
///
/// The numeric values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum HandleType {
    /// No target; only valid as a channel target kind.
    None = 0,
    /// A contact.
    Contact = 1,
    /// A chat room.
    Room = 2,
    /// One of the server-side contact lists.
    List = 3,
    /// A user-defined contact group.
    Group = 4,
}

impl HandleType {
    /// All kinds that can have a handle repository, in wire order.
    pub const REPOSITORY_KINDS: [HandleType; 4] = [
        HandleType::Contact,
        HandleType::Room,
        HandleType::List,
        HandleType::Group,
    ];

    /// Converts the wire value, rejecting unknown kinds.
    pub fn from_u32(raw: u32) -> TpResult<Self> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Contact),
            2 => Ok(Self::Room),
            3 => Ok(Self::List),
            4 => Ok(Self::Group),
            other => Err(TpError::invalid_argument(format!(
                "handle type {other} is not valid"
            ))),
        }
    }

    /// Returns the wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Human-readable name used in log and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Contact => "contact",
            Self::Room => "room",
            Self::List => "list",
            Self::Group => "group",
        }
    }
}

impl fmt::Display for HandleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four server-side contact lists exposed through the LIST repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListName {
    /// Contacts whose presence we receive (or asked to).
    Subscribe,
    /// Contacts who receive our presence (or asked to).
    Publish,
    /// Every contact stored on the server-side roster.
    Stored,
    /// Blocked contacts.
    Deny,
}

impl ListName {
    /// Fixed members of the LIST repository; handle `n` is `ALL[n - 1]`.
    pub const ALL: [ListName; 4] = [
        ListName::Subscribe,
        ListName::Publish,
        ListName::Stored,
        ListName::Deny,
    ];

    /// The identifier of this list inside the LIST repository.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Publish => "publish",
            Self::Stored => "stored",
            Self::Deny => "deny",
        }
    }

    /// Parses a list identifier.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == name)
    }

    /// The static handle of this list.
    pub fn handle(self) -> Handle {
        let index = Self::ALL
            .iter()
            .position(|l| *l == self)
            .unwrap_or_default();
        Handle::new(index as u32 + 1)
    }

    /// Inverse of [`ListName::handle`].
    pub fn from_handle(handle: Handle) -> Option<Self> {
        let index = handle.get().checked_sub(1)? as usize;
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for ListName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
