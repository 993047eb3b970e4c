//! Income entries and the eligibility summary computed from them.
//!
//! Components:
//! - `types`: the persisted `IncomeEntry`, the form-side `NewIncome` and the
//!   eligibility `Thresholds`.
//! - `summary`: totals, remaining allowance, progress level and chart data.

pub mod summary;
pub mod types;

pub use summary::{format_currency, ChartSegment, IncomeSummary, ProgressLevel};
pub use types::{
    generate_entry_id, sort_for_display, IncomeEntry, IncomeType, NewIncome, Thresholds,
    DEFAULT_DESCRIPTION,
};
