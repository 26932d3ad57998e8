//! Severity scale for steps and operations.
//!
//! Terminal severities escalate (`Ok < Warning < Ko < Fatal`) and are
//! aggregated by taking the maximum seen so far. `Unknown` means nothing has
//! been reported; `Running` is a transient marker stamped on a step the
//! instant its execution starts and is used only for crash-recovery
//! detection. Neither has a severity rank: comparisons go through an
//! explicit rank table rather than the enum's declaration order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome severity of a step or an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Nothing reported yet
    Unknown,
    /// Transient: the step is currently executing
    Running,
    /// Success
    Ok,
    /// Success with warnings
    Warning,
    /// Business failure
    Ko,
    /// Technical failure; the operation pauses for inspection
    Fatal,
}

impl StatusCode {
    /// Rank on the terminal severity scale. `Unknown` and `Running` are not
    /// part of the scale and have no rank.
    fn rank(self) -> Option<u8> {
        match self {
            StatusCode::Unknown | StatusCode::Running => None,
            StatusCode::Ok => Some(1),
            StatusCode::Warning => Some(2),
            StatusCode::Ko => Some(3),
            StatusCode::Fatal => Some(4),
        }
    }

    /// Aggregate an incoming severity into this one: the maximum of the two
    /// on the terminal scale. An unranked incoming value never raises the
    /// aggregate; an unranked existing value is replaced outright.
    pub fn merge(self, incoming: StatusCode) -> StatusCode {
        match (self.rank(), incoming.rank()) {
            (_, None) => self,
            (None, Some(_)) => incoming,
            (Some(a), Some(b)) => {
                if b > a {
                    incoming
                } else {
                    self
                }
            }
        }
    }

    /// True when this severity is at or above `floor` on the terminal scale.
    /// Unranked values are below everything.
    pub fn at_least(self, floor: StatusCode) -> bool {
        match (self.rank(), floor.rank()) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }

    /// True for the transient running marker
    pub fn is_running(self) -> bool {
        self == StatusCode::Running
    }

    /// True when a terminal severity has been recorded
    pub fn is_terminal(self) -> bool {
        self.rank().is_some()
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::Unknown
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::Running => "RUNNING",
            StatusCode::Ok => "OK",
            StatusCode::Warning => "WARNING",
            StatusCode::Ko => "KO",
            StatusCode::Fatal => "FATAL",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_max_on_terminal_scale() {
        assert_eq!(StatusCode::Ok.merge(StatusCode::Warning), StatusCode::Warning);
        assert_eq!(StatusCode::Warning.merge(StatusCode::Ok), StatusCode::Warning);
        assert_eq!(StatusCode::Ko.merge(StatusCode::Fatal), StatusCode::Fatal);
        assert_eq!(StatusCode::Fatal.merge(StatusCode::Ok), StatusCode::Fatal);
    }

    #[test]
    fn test_merge_ignores_transient_incoming() {
        assert_eq!(StatusCode::Ko.merge(StatusCode::Running), StatusCode::Ko);
        assert_eq!(StatusCode::Ok.merge(StatusCode::Unknown), StatusCode::Ok);
    }

    #[test]
    fn test_merge_replaces_unranked_existing() {
        assert_eq!(StatusCode::Unknown.merge(StatusCode::Ok), StatusCode::Ok);
        assert_eq!(StatusCode::Running.merge(StatusCode::Ko), StatusCode::Ko);
    }

    #[test]
    fn test_at_least() {
        assert!(StatusCode::Fatal.at_least(StatusCode::Ko));
        assert!(StatusCode::Ko.at_least(StatusCode::Ko));
        assert!(!StatusCode::Warning.at_least(StatusCode::Ko));
        // Unranked values are never at or above anything
        assert!(!StatusCode::Running.at_least(StatusCode::Ok));
        assert!(!StatusCode::Unknown.at_least(StatusCode::Ok));
    }

    #[test]
    fn test_monotonic_aggregation() {
        // For any sequence of merges, the aggregate never decreases
        let sequence = [
            StatusCode::Ok,
            StatusCode::Running,
            StatusCode::Warning,
            StatusCode::Ok,
            StatusCode::Ko,
            StatusCode::Warning,
        ];
        let mut aggregate = StatusCode::Unknown;
        let mut last_rank = 0u8;
        for code in sequence {
            aggregate = aggregate.merge(code);
            let rank = match aggregate {
                StatusCode::Ok => 1,
                StatusCode::Warning => 2,
                StatusCode::Ko => 3,
                StatusCode::Fatal => 4,
                _ => 0,
            };
            assert!(rank >= last_rank);
            last_rank = rank;
        }
        assert_eq!(aggregate, StatusCode::Ko);
    }

    #[test]
    fn test_serialization() {
        let serialized = serde_json::to_string(&StatusCode::Fatal).unwrap();
        let deserialized: StatusCode = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, StatusCode::Fatal);
    }
}
