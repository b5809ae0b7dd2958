//! Names of the key/value stores.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use marshal_sync::Topic;

use crate::MasterError;

/// One of the two persisted key/value stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Database {
    Devices,
    Parameters,
}

impl Database {
    /// Topic the store is published on.
    pub fn topic(self) -> Topic {
        match self {
            Database::Devices => Topic::Devices,
            Database::Parameters => Topic::Parameters,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Database::Devices => "devices",
            Database::Parameters => "parameters",
        }
    }
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Database {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "devices" => Ok(Database::Devices),
            "parameters" => Ok(Database::Parameters),
            other => Err(MasterError::UnknownDatabase(other.to_string())),
        }
    }
}
