//! Render credit pricing, quota refresh rules, and ledger records.
//!
//! The cost model and the monthly refresh rule are pure functions so the
//! in-memory and PostgreSQL stores apply them identically.

use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::render::RenderSettings;
use crate::types::{EntityId, Timestamp};

// ---------------------------------------------------------------------------
// Cost model
// ---------------------------------------------------------------------------

/// Credits charged for every render.
pub const BASE_COST: u32 = 1;

/// Pixel count above which the first size surcharge applies (1 MP).
pub const LARGE_PIXEL_THRESHOLD: u64 = 1_048_576;

/// Pixel count at or above which the second size surcharge applies (4096×4096).
pub const XL_PIXEL_THRESHOLD: u64 = 16_777_216;

/// Surcharge for renders above [`LARGE_PIXEL_THRESHOLD`].
pub const LARGE_SURCHARGE: u32 = 1;

/// Additional surcharge for renders reaching [`XL_PIXEL_THRESHOLD`], stacked on
/// top of [`LARGE_SURCHARGE`].
pub const XL_SURCHARGE: u32 = 2;

/// Requested quality above which the quality surcharge applies.
pub const HIGH_QUALITY_THRESHOLD: u8 = 75;

/// Surcharge for high-quality renders.
pub const HIGH_QUALITY_SURCHARGE: u32 = 1;

/// Credits charged for a render with the given settings.
pub fn calculate_cost(settings: &RenderSettings) -> u32 {
    let pixels = settings.resolution.pixel_count();
    let mut cost = BASE_COST;

    if pixels > LARGE_PIXEL_THRESHOLD {
        cost += LARGE_SURCHARGE;
        if pixels >= XL_PIXEL_THRESHOLD {
            cost += XL_SURCHARGE;
        }
    }
    if settings.quality > HIGH_QUALITY_THRESHOLD {
        cost += HIGH_QUALITY_SURCHARGE;
    }

    cost
}

// ---------------------------------------------------------------------------
// Quota
// ---------------------------------------------------------------------------

/// Per-organization render credit counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub organization_id: EntityId,
    pub total: u32,
    pub used: u32,
    pub remaining: u32,
    pub refresh_date: Timestamp,
}

impl QuotaStatus {
    pub fn new(
        organization_id: impl Into<EntityId>,
        total: u32,
        used: u32,
        refresh_date: Timestamp,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            total,
            used,
            remaining: total.saturating_sub(used),
            refresh_date,
        }
    }

    /// Apply the monthly reset if `now` has reached the refresh date.
    ///
    /// Returns `true` when a reset happened. Calling it again in the same
    /// month is a no-op because the refresh date moves into the future.
    pub fn refresh_if_due(&mut self, now: Timestamp) -> bool {
        if !refresh_due(self.refresh_date, now) {
            return false;
        }
        self.used = 0;
        self.remaining = self.total;
        self.refresh_date = next_refresh_date(now);
        true
    }
}

/// Whether the quota window ending at `refresh_date` has elapsed.
pub fn refresh_due(refresh_date: Timestamp, now: Timestamp) -> bool {
    now >= refresh_date
}

/// Midnight UTC on the first day of the month after `now`.
pub fn next_refresh_date(now: Timestamp) -> Timestamp {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let date = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    Utc.from_utc_datetime(&date)
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Consume,
    Refund,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consume => "consume",
            Self::Refund => "refund",
        }
    }
}

/// Append-only audit record of one credit movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: EntityId,
    pub organization_id: EntityId,
    pub user_id: EntityId,
    pub render_id: EntityId,
    pub amount: u32,
    pub kind: TransactionKind,
    pub description: String,
    pub created_at: Timestamp,
}

/// Outcome of an atomic consume attempt at the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    /// Credits were reserved; carries the quota after the increment.
    Consumed(QuotaStatus),
    /// Not enough credits remained; nothing changed except a due refresh.
    Insufficient(QuotaStatus),
}
