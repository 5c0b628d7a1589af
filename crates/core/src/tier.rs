//! Subscription tiers and the per-tier policy they drive.
//!
//! A tier decides two things in the render pipeline: the queue priority a
//! submitted job receives and the submission rate limits applied by the
//! admission controller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Priority constants (lower value = served first)
// ---------------------------------------------------------------------------

/// Queue priority for growth-tier jobs.
pub const PRIORITY_GROWTH: i32 = 1;

/// Queue priority for pro-tier jobs.
pub const PRIORITY_PRO: i32 = 3;

/// Queue priority for starter-tier jobs.
pub const PRIORITY_STARTER: i32 = 5;

// ---------------------------------------------------------------------------
// SubscriptionTier
// ---------------------------------------------------------------------------

/// Subscription level of the organization submitting a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Starter,
    Pro,
    Growth,
}

/// Submission rate limits for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 3] = [Self::Starter, Self::Pro, Self::Growth];

    /// Queue priority derived from the tier.
    pub fn queue_priority(self) -> i32 {
        match self {
            Self::Starter => PRIORITY_STARTER,
            Self::Pro => PRIORITY_PRO,
            Self::Growth => PRIORITY_GROWTH,
        }
    }

    /// Sliding-window submission limits for the tier.
    pub fn rate_limits(self) -> RateLimits {
        match self {
            Self::Starter => RateLimits {
                per_minute: 2,
                per_hour: 20,
            },
            Self::Pro => RateLimits {
                per_minute: 10,
                per_hour: 100,
            },
            Self::Growth => RateLimits {
                per_minute: 20,
                per_hour: 300,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Growth => "growth",
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "growth" => Ok(Self::Growth),
            other => Err(CoreError::Validation(format!(
                "Invalid subscription tier '{other}'. Must be one of: starter, pro, growth"
            ))),
        }
    }
}
