//! The fixed ordered time periods of a simulated day.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePeriod {
    Morning,
    Noon,
    Afternoon,
    Evening,
    Night,
}

impl TimePeriod {
    /// Full day, in order.
    pub const ALL: [TimePeriod; 5] = [
        TimePeriod::Morning,
        TimePeriod::Noon,
        TimePeriod::Afternoon,
        TimePeriod::Evening,
        TimePeriod::Night,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TimePeriod::Morning => "morning",
            TimePeriod::Noon => "noon",
            TimePeriod::Afternoon => "afternoon",
            TimePeriod::Evening => "evening",
            TimePeriod::Night => "night",
        }
    }

    /// Characters are at home in the morning and evening, at work otherwise.
    pub fn is_home_time(self) -> bool {
        matches!(self, TimePeriod::Morning | TimePeriod::Evening)
    }
}

impl fmt::Display for TimePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimePeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "morning" => Ok(TimePeriod::Morning),
            "noon" => Ok(TimePeriod::Noon),
            "afternoon" => Ok(TimePeriod::Afternoon),
            "evening" => Ok(TimePeriod::Evening),
            "night" => Ok(TimePeriod::Night),
            other => Err(format!("unknown time period: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_ordered() {
        let mut sorted = TimePeriod::ALL;
        sorted.sort();
        assert_eq!(sorted, TimePeriod::ALL);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("MORNING".parse::<TimePeriod>().unwrap(), TimePeriod::Morning);
        assert_eq!(" night ".parse::<TimePeriod>().unwrap(), TimePeriod::Night);
        assert!("dusk".parse::<TimePeriod>().is_err());
    }

    #[test]
    fn home_for_morning_and_evening_only() {
        assert!(TimePeriod::Morning.is_home_time());
        assert!(TimePeriod::Evening.is_home_time());
        assert!(!TimePeriod::Noon.is_home_time());
        assert!(!TimePeriod::Afternoon.is_home_time());
        assert!(!TimePeriod::Night.is_home_time());
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&TimePeriod::Afternoon).unwrap();
        assert_eq!(json, "\"afternoon\"");
        let back: TimePeriod = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TimePeriod::Afternoon);
    }
}
