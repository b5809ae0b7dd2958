//! Published topic names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::SyncError;

/// A named piece of canonical state replicated to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Runs currently known to the scheduler, keyed by run id.
    Queue,
    /// Periodic submission templates, keyed by template id.
    Periodic,
    /// Device database contents.
    Devices,
    /// Parameter database contents.
    Parameters,
    /// Most recent parameter writes, oldest first.
    ParametersHistory,
}

impl Topic {
    /// Every topic, in a stable order.
    pub const ALL: [Topic; 5] = [
        Topic::Queue,
        Topic::Periodic,
        Topic::Devices,
        Topic::Parameters,
        Topic::ParametersHistory,
    ];

    /// Wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Queue => "queue",
            Topic::Periodic => "periodic",
            Topic::Devices => "devices",
            Topic::Parameters => "parameters",
            Topic::ParametersHistory => "parameters_history",
        }
    }

    /// Value a topic holds before anything has been published to it.
    pub fn initial_value(&self) -> serde_json::Value {
        match self {
            Topic::ParametersHistory => serde_json::Value::Array(Vec::new()),
            _ => serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| SyncError::UnknownTopic(s.to_string()))
    }
}
