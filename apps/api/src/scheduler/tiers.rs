use std::fmt;

use serde::{Deserialize, Serialize};

/// Hard stop across all tiers, whatever the candidate asks for.
pub const DAILY_SAFETY_CEILING: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    High,
    Medium,
    Low,
}

/// Per-tier pacing. Windows are `[start, end)` hours in candidate-local time.
#[derive(Debug, Clone, Copy)]
pub struct TierPolicy {
    pub daily_cap: u32,
    pub delay_minutes: i64,
    pub windows: &'static [(u32, u32)],
}

impl Tier {
    pub const ORDER: [Tier; 3] = [Tier::High, Tier::Medium, Tier::Low];

    pub fn for_score(score: f64) -> Tier {
        if score >= 80.0 {
            Tier::High
        } else if score >= 60.0 {
            Tier::Medium
        } else {
            Tier::Low
        }
    }

    pub fn policy(&self) -> TierPolicy {
        match self {
            Tier::High => TierPolicy {
                daily_cap: 15,
                delay_minutes: 30,
                windows: &[(9, 11), (14, 16)],
            },
            Tier::Medium => TierPolicy {
                daily_cap: 25,
                delay_minutes: 60,
                windows: &[(9, 17)],
            },
            Tier::Low => TierPolicy {
                daily_cap: 10,
                delay_minutes: 120,
                windows: &[(10, 16)],
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(Tier::for_score(80.0), Tier::High);
        assert_eq!(Tier::for_score(79.9), Tier::Medium);
        assert_eq!(Tier::for_score(60.0), Tier::Medium);
        assert_eq!(Tier::for_score(59.9), Tier::Low);
        assert_eq!(Tier::for_score(0.0), Tier::Low);
    }
}
