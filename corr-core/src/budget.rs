//! Budget ledger: the single source of truth for monthly AI spend.
//! Every paid operation goes through `reserve` → (`commit` | `release`);
//! the ladder in [`DegradationLevel`] is read by the orchestrator before
//! choosing which tiers to run.

use std::sync::Mutex;

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{BudgetConfig, ThresholdsConfig};
use crate::error::{BudgetError, CorrError, Result};

/// Per-month usage counters, persisted alongside the spend totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCounters {
    pub embed_tokens: u64,
    pub embed_requests: u64,
    pub llm_tokens: u64,
    pub llm_requests: u64,
}

/// Spend and reservation state for one calendar month, in micro-USD
/// (`1_000_000` == $1) to keep the ledger's arithmetic exact.
#[derive(Debug, Clone, Copy, Default)]
struct MonthRecord {
    year: i32,
    month: u32,
    spent_micro: i64,
    reserved_micro: i64,
    counters: LedgerCounters,
    next_handle: u64,
}

impl MonthRecord {
    fn for_now() -> Self {
        let now = Utc::now();
        Self {
            year: now.year(),
            month: now.month(),
            spent_micro: 0,
            reserved_micro: 0,
            counters: LedgerCounters::default(),
            next_handle: 1,
        }
    }

    fn is_current(&self) -> bool {
        let now = Utc::now();
        self.year == now.year() && self.month == now.month()
    }
}

/// A snapshot of the ledger's state, safe to hand out without holding the lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSnapshot {
    pub spent_micro: i64,
    pub reserved_micro: i64,
    pub cap_micro: i64,
    pub year: i32,
    pub month: u32,
    pub counters: LedgerCounters,
}

/// Persisted form of one month's ledger state: one JSON document per month,
/// keyed `ledger/YYYYMM`. `reserved_micro` records the snapshot moment only;
/// reservations are process-local, so [`BudgetLedger::restore`] ignores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerDocument {
    /// `YYYYMM` month key.
    pub month: String,
    pub spent_micro: i64,
    #[serde(default)]
    pub reserved_micro: i64,
    pub cap_micro: i64,
    #[serde(default)]
    pub counters: LedgerCounters,
}

impl BudgetSnapshot {
    pub fn month_key(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    pub fn to_document(&self) -> LedgerDocument {
        LedgerDocument {
            month: self.month_key(),
            spent_micro: self.spent_micro,
            reserved_micro: self.reserved_micro,
            cap_micro: self.cap_micro,
            counters: self.counters,
        }
    }
}

impl BudgetSnapshot {
    pub fn used_fraction(&self) -> f64 {
        if self.cap_micro <= 0 {
            return 1.0;
        }
        (self.spent_micro + self.reserved_micro) as f64 / self.cap_micro as f64
    }
}

/// Central degradation ladder, read by the orchestrator before each tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DegradationLevel {
    /// Below the warn threshold: proceed normally.
    Normal,
    /// >= warn threshold: warn and prefer cache-only embedding.
    Warn,
    /// >= disable-LLM threshold: LLM tier is skipped entirely.
    LlmDisabled,
    /// >= deny-all threshold: no paid operation may proceed.
    DenyAll,
}

/// Classify a used fraction against the configured ladder.
pub fn classify_degradation(used_fraction: f64, thresholds: &ThresholdsConfig) -> DegradationLevel {
    if used_fraction >= thresholds.degrade_deny_all_pct {
        DegradationLevel::DenyAll
    } else if used_fraction >= thresholds.degrade_disable_llm_pct {
        DegradationLevel::LlmDisabled
    } else if used_fraction >= thresholds.degrade_warn_pct {
        DegradationLevel::Warn
    } else {
        DegradationLevel::Normal
    }
}

/// Reservation handle returned by `reserve`, redeemed via `commit` or `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationHandle(u64);

pub fn usd_to_micro(usd: f64) -> i64 {
    (usd * 1_000_000.0).round() as i64
}

pub fn micro_to_usd(micro: i64) -> f64 {
    micro as f64 / 1_000_000.0
}

#[derive(Debug)]
pub struct BudgetLedger {
    cap_micro: i64,
    month: Mutex<MonthRecord>,
}

impl BudgetLedger {
    pub fn new(config: &BudgetConfig) -> Self {
        let cap_micro = usd_to_micro(config.monthly_cap_usd);
        Self {
            cap_micro,
            month: Mutex::new(MonthRecord::for_now()),
        }
    }

    /// Construct a ledger seeded from a previously persisted month document.
    /// The document is ignored if its month key isn't the current UTC month —
    /// rollover archives old months rather than carrying them forward.
    pub fn restore(config: &BudgetConfig, document: &LedgerDocument) -> Self {
        let ledger = Self::new(config);
        {
            let mut guard = ledger.month.lock().expect("budget ledger mutex poisoned");
            if guard.is_current() && document.month == format!("{:04}{:02}", guard.year, guard.month) {
                guard.spent_micro = document.spent_micro.max(0);
                guard.counters = document.counters;
            }
        }
        ledger
    }

    fn with_current_month<R>(&self, f: impl FnOnce(&mut MonthRecord) -> R) -> R {
        let mut guard = self.month.lock().expect("budget ledger mutex poisoned");
        if !guard.is_current() {
            *guard = MonthRecord::for_now();
        }
        f(&mut guard)
    }

    /// Non-binding check: would `cost_micro` fit under the remaining budget
    /// right now? Does not reserve anything.
    pub fn project(&self, cost_micro: i64) -> bool {
        self.with_current_month(|m| m.spent_micro + m.reserved_micro + cost_micro <= self.cap_micro)
    }

    /// Atomically reserve `cost_micro`, returning a handle to redeem later.
    /// Denies (without mutating state) if the reservation would exceed cap.
    pub fn reserve(&self, cost_micro: i64) -> Result<ReservationHandle> {
        self.with_current_month(|m| {
            let remaining = self.cap_micro - m.spent_micro - m.reserved_micro;
            if cost_micro > remaining {
                return Err(CorrError::Budget(BudgetError::Denied {
                    projected_micro: cost_micro,
                    remaining_micro: remaining,
                }));
            }
            let handle = ReservationHandle(m.next_handle);
            m.next_handle += 1;
            m.reserved_micro += cost_micro;
            Ok(handle)
        })
    }

    /// Redeem a reservation at its actual realized cost: subtract the
    /// reservation, add the real spend. `actual_micro` may differ from the
    /// amount originally reserved (e.g. actual token usage).
    pub fn commit(&self, handle: ReservationHandle, reserved_micro: i64, actual_micro: i64) -> Result<()> {
        self.with_current_month(|m| {
            if handle.0 == 0 || handle.0 >= m.next_handle {
                return Err(CorrError::Budget(BudgetError::UnknownReservation(handle.0)));
            }
            m.reserved_micro = (m.reserved_micro - reserved_micro).max(0);
            m.spent_micro += actual_micro;
            Ok(())
        })
    }

    /// Release a reservation without spending anything (e.g. the call failed
    /// before any tokens were consumed).
    pub fn release(&self, handle: ReservationHandle, reserved_micro: i64) -> Result<()> {
        self.with_current_month(|m| {
            if handle.0 == 0 || handle.0 >= m.next_handle {
                return Err(CorrError::Budget(BudgetError::UnknownReservation(handle.0)));
            }
            m.reserved_micro = (m.reserved_micro - reserved_micro).max(0);
            Ok(())
        })
    }

    /// Fold one embedding request's usage into the month counters.
    pub fn record_embed_usage(&self, tokens: u64, requests: u64) {
        self.with_current_month(|m| {
            m.counters.embed_tokens += tokens;
            m.counters.embed_requests += requests;
        });
    }

    /// Fold one LLM request's usage into the month counters.
    pub fn record_llm_usage(&self, tokens: u64, requests: u64) {
        self.with_current_month(|m| {
            m.counters.llm_tokens += tokens;
            m.counters.llm_requests += requests;
        });
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        self.with_current_month(|m| BudgetSnapshot {
            spent_micro: m.spent_micro,
            reserved_micro: m.reserved_micro,
            cap_micro: self.cap_micro,
            year: m.year,
            month: m.month,
            counters: m.counters,
        })
    }

    pub fn degradation(&self, thresholds: &ThresholdsConfig) -> DegradationLevel {
        let level = classify_degradation(self.snapshot().used_fraction(), thresholds);
        if level >= DegradationLevel::Warn {
            warn!(?level, "budget ledger is degrading paid tiers");
        }
        level
    }
}
