use serde::Serialize;

use super::types::{IncomeEntry, IncomeType, Thresholds};

/// Colour band of the limit progress bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProgressLevel {
    Normal,
    Warning,
    Critical,
}

impl ProgressLevel {
    fn from_percent(percent: f64) -> Self {
        if percent >= 90.0 {
            ProgressLevel::Critical
        } else if percent >= 75.0 {
            ProgressLevel::Warning
        } else {
            ProgressLevel::Normal
        }
    }
}

/// One slice of the income doughnut chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSegment {
    pub label: &'static str,
    pub amount: f64,
    /// Share of the chart total, rounded to a whole percent.
    pub percent: i64,
}

/// Totals the UI shows next to the entry table.
///
/// Only job income counts against the limit; the fixed benefit is reported
/// at its configured amount regardless of how many benefit entries exist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomeSummary {
    pub fixed_benefit_total: f64,
    pub job_total: f64,
    pub remaining_allowed: f64,
    pub progress_percent: f64,
    pub level: ProgressLevel,
    pub income_limit: f64,
}

// Sums are done in whole cents so repeated additions do not drift.
fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

fn from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

impl IncomeSummary {
    pub fn compute(entries: &[IncomeEntry], thresholds: &Thresholds) -> Self {
        let job_cents: i64 = entries
            .iter()
            .filter(|e| e.kind == IncomeType::Job)
            .map(|e| to_cents(e.amount))
            .sum();
        let limit_cents = to_cents(thresholds.income_limit);
        let remaining_cents = (limit_cents - job_cents).max(0);

        let progress_percent = if limit_cents > 0 {
            (job_cents as f64 / limit_cents as f64 * 100.0).min(100.0)
        } else if job_cents > 0 {
            100.0
        } else {
            0.0
        };

        Self {
            fixed_benefit_total: thresholds.fixed_benefit_amount,
            job_total: from_cents(job_cents),
            remaining_allowed: from_cents(remaining_cents),
            progress_percent,
            level: ProgressLevel::from_percent(progress_percent),
            income_limit: thresholds.income_limit,
        }
    }

    /// Segments in chart order: benefit, job, and what is left under the limit
    /// after both.
    pub fn chart_segments(&self) -> Vec<ChartSegment> {
        let benefit = to_cents(self.fixed_benefit_total);
        let job = to_cents(self.job_total);
        let remaining = (to_cents(self.income_limit) - benefit - job).max(0);
        let total = benefit + job + remaining;

        [
            ("SSI Income", benefit),
            ("Job Income", job),
            ("Remaining Allowed", remaining),
        ]
        .into_iter()
        .map(|(label, cents)| ChartSegment {
            label,
            amount: from_cents(cents),
            percent: if total > 0 {
                (cents as f64 / total as f64 * 100.0).round() as i64
            } else {
                0
            },
        })
        .collect()
    }
}

/// Formats an amount as US dollars, e.g. `$1,700.00` or `-$5.25`.
pub fn format_currency(amount: f64) -> String {
    let cents = to_cents(amount);
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    let dollars = (cents / 100).to_string();

    let mut grouped = String::with_capacity(dollars.len() + dollars.len() / 3);
    for (i, ch) in dollars.chars().enumerate() {
        if i > 0 && (dollars.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{}${}.{:02}", sign, grouped, cents % 100)
}
