//! The fixed, closed set of capability scopes a session key can carry.

use serde::{Deserialize, Serialize};
use session_error::{Result, SessionError};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Spend,
    Read,
    Streams,
    Escrow,
    Delegate,
}

impl Scope {
    pub const ALL: [Scope; 5] = [
        Scope::Spend,
        Scope::Read,
        Scope::Streams,
        Scope::Escrow,
        Scope::Delegate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Spend => "spend",
            Scope::Read => "read",
            Scope::Streams => "streams",
            Scope::Escrow => "escrow",
            Scope::Delegate => "delegate",
        }
    }

    pub fn parse(raw: &str) -> Result<Scope> {
        match raw.to_ascii_lowercase().as_str() {
            "spend" => Ok(Scope::Spend),
            "read" => Ok(Scope::Read),
            "streams" => Ok(Scope::Streams),
            "escrow" => Ok(Scope::Escrow),
            "delegate" => Ok(Scope::Delegate),
            _ => Err(SessionError::InvalidScope(raw.to_string())),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The scopes a key carries when none were explicitly requested.
pub fn default_scopes() -> HashSet<Scope> {
    [Scope::Spend, Scope::Read].into_iter().collect()
}

/// Parses a set of scope strings, rejecting anything outside [`Scope::ALL`].
pub fn parse_scope_set<'a>(raw: impl IntoIterator<Item = &'a str>) -> Result<HashSet<Scope>> {
    raw.into_iter().map(Scope::parse).collect()
}
