use crate::model::LogStatus;

/// Outcome counts over a set of log entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub total: usize,
    pub success: usize,
    pub error: usize,
    pub warning: usize,
}

/// Count statuses. Warnings add to the total but to neither success nor error.
pub fn compute_outcome_counts<I>(statuses: I) -> OutcomeCounts
where
    I: IntoIterator<Item = LogStatus>,
{
    statuses
        .into_iter()
        .fold(OutcomeCounts::default(), |mut acc, status| {
            acc.total += 1;
            match status {
                LogStatus::Success => acc.success += 1,
                LogStatus::Error => acc.error += 1,
                LogStatus::Warning => acc.warning += 1,
            }
            acc
        })
}

/// Success percentage rounded to one decimal, `0.0` when there is nothing to count.
pub fn compute_success_rate(success: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = success as f64 / total as f64 * 100.0;
    (pct * 10.0).round() / 10.0
}

/// Display form of a success rate: `"0"` for an empty set, otherwise one decimal place.
pub fn format_success_rate(rate: f64, total: usize) -> String {
    if total == 0 {
        "0".to_string()
    } else {
        format!("{rate:.1}")
    }
}
