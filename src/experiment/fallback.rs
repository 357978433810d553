use std::fmt;

/// Why a cycle did not use a fresh reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackWarning {
    StaleSubstituted,
    NoData,
}

impl fmt::Display for FallbackWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackWarning::StaleSubstituted => f.write_str("stale value substituted"),
            FallbackWarning::NoData => f.write_str("no data available"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolved {
    pub value: f64,
    pub last_good: Option<f64>,
    pub warning: Option<FallbackWarning>,
}

/// Pick the value a channel contributes this cycle.
///
/// A fresh reading wins and becomes the new fallback. A miss reuses the last good
/// reading, or yields NaN if the channel has never produced one.
pub fn resolve(reading: Option<f64>, last_good: Option<f64>) -> Resolved {
    match (reading, last_good) {
        (Some(value), _) => Resolved {
            value,
            last_good: Some(value),
            warning: None,
        },
        (None, Some(previous)) => Resolved {
            value: previous,
            last_good,
            warning: Some(FallbackWarning::StaleSubstituted),
        },
        (None, None) => Resolved {
            value: f64::NAN,
            last_good: None,
            warning: Some(FallbackWarning::NoData),
        },
    }
}
