//! Message priority.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Delivery priority carried by outbox rows and envelopes.
///
/// Serialized as its ordinal (1–4), which is also the broker priority value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TryFrom<u8> for Priority {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            4 => Ok(Self::Critical),
            other => Err(CoreError::InvalidPriority(other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.as_u8()
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_ordinal() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "3");
        let p: Priority = serde_json::from_str("4").unwrap();
        assert_eq!(p, Priority::Critical);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(serde_json::from_str::<Priority>("0").is_err());
        assert_eq!(Priority::try_from(9), Err(CoreError::InvalidPriority(9)));
    }
}
