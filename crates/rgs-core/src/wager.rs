use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Money;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WagerStatus {
    Pending,
    Settled,
    Canceled,
}

/// A wager's lifecycle state (§3 `Wager`, §4.F state machine).
///
/// ```text
///            PlaceWager             SettleWager
///   ∅  ───────────────▶  pending ──────────────▶  settled  (terminal)
///                          │
///                          └── CancelWager ───▶  canceled (terminal)
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Wager {
    pub wager_id: String,
    pub player_id: String,
    pub game_id: String,
    pub stake: Money,
    pub status: WagerStatus,
    pub payout: Option<Money>,
    pub outcome_ref: Option<String>,
    pub placed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}
