//! Cash reconciliation for ParkPoint shifts.
//!
//! Pure arithmetic over an aggregated [`ShiftTotals`] snapshot: expected
//! drawer cash, signed discrepancy against the operator's physical count,
//! and the match / minor / significant classification used by the shift-end
//! confirmation gate. No database access and no hidden state — callers
//! re-aggregate and recompute whenever an input changes.

use serde::Serialize;

/// Discrepancies at or above this many currency units are significant and
/// require explicit confirmation at shift end.
pub const DISCREPANCY_THRESHOLD: f64 = 100.0;

/// Discrepancies strictly below this are treated as a match (counting noise).
pub const MATCH_TOLERANCE: f64 = 10.0;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Aggregated ledger totals for one shift.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShiftTotals {
    pub opening_cash: f64,
    pub cash_revenue: f64,
    pub digital_revenue: f64,
    pub vehicles_processed: i64,
    pub total_expenses: f64,
    pub cash_deposits: f64,
    pub digital_deposits: f64,
}

impl ShiftTotals {
    /// Cash that should be in the drawer right now: opening float plus cash
    /// collected, minus expenses paid out and cash removed as deposits.
    pub fn expected_closing_cash(&self) -> f64 {
        self.opening_cash + self.cash_revenue - self.total_expenses - self.cash_deposits
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// How far the entered count is from the expected figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyClass {
    Match,
    Minor,
    Significant,
}

/// Classify a signed discrepancy.
///
/// Boundaries are half-open: exactly 10 is already Minor, exactly 100 is
/// already Significant.
pub fn classify(discrepancy: f64) -> DiscrepancyClass {
    let magnitude = discrepancy.abs();
    if magnitude < MATCH_TOLERANCE {
        DiscrepancyClass::Match
    } else if magnitude < DISCREPANCY_THRESHOLD {
        DiscrepancyClass::Minor
    } else {
        DiscrepancyClass::Significant
    }
}

// ---------------------------------------------------------------------------
// Reconciliation result
// ---------------------------------------------------------------------------

/// Outcome of comparing an entered cash count against the expected figure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub expected_closing_cash: f64,
    pub entered_closing_cash: f64,
    /// Signed: positive = excess cash in the drawer, negative = shortage.
    pub discrepancy: f64,
    pub class: DiscrepancyClass,
}

impl Reconciliation {
    pub fn is_significant(&self) -> bool {
        self.class == DiscrepancyClass::Significant
    }

    /// One-line annotation appended to `shift_notes` when a significant
    /// discrepancy is recorded at shift end.
    pub fn audit_note(&self) -> String {
        let direction = if self.discrepancy >= 0.0 {
            "excess"
        } else {
            "shortage"
        };
        format!(
            "SIGNIFICANT CASH DISCREPANCY: {direction} of {:.2} (expected {:.2}, counted {:.2})",
            self.discrepancy.abs(),
            self.expected_closing_cash,
            self.entered_closing_cash,
        )
    }
}

/// Reconcile an entered cash count against the shift's aggregated totals.
pub fn reconcile(totals: &ShiftTotals, entered_closing_cash: f64) -> Reconciliation {
    let expected = totals.expected_closing_cash();
    let discrepancy = entered_closing_cash - expected;
    Reconciliation {
        expected_closing_cash: expected,
        entered_closing_cash,
        discrepancy,
        class: classify(discrepancy),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
