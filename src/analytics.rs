//! Execution analytics over personal or team log sets.
//!
//! Rows are flattened out of the per-script maps, filtered by an ordered conjunction of
//! status, time window, category and (team mode) user, then sorted. Counts always reflect the
//! full filtered set; only the surfaced row list is capped.

use crate::catalog::Catalog;
use crate::clock;
use crate::metrics;
use crate::model::{LogEntry, LogStatus, ScriptId, ScriptLogs, TeamLogSet};
use serde::Serialize;
use std::str::FromStr;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRow {
    pub script_id: ScriptId,
    /// Owning user; only set for rows flattened from a team log set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(flatten)]
    pub entry: LogEntry,
}

pub fn flatten_personal(logs: &ScriptLogs) -> Vec<LogRow> {
    logs.iter()
        .flat_map(|(id, entries)| {
            entries.iter().map(move |e| LogRow {
                script_id: *id,
                username: None,
                entry: e.clone(),
            })
        })
        .collect()
}

pub fn flatten_team(team: &TeamLogSet) -> Vec<LogRow> {
    team.iter()
        .flat_map(|(user, logs)| {
            flatten_personal(logs).into_iter().map(move |mut row| {
                row.username = Some(user.clone());
                row
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Success,
    Error,
}

impl StatusFilter {
    fn accepts(self, status: LogStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Success => status == LogStatus::Success,
            StatusFilter::Error => status == LogStatus::Error,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(StatusFilter::All),
            "success" => Ok(StatusFilter::Success),
            "error" => Ok(StatusFilter::Error),
            other => Err(format!("unknown status filter '{other}' (expected all, success, error)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeWindow {
    LastHour,
    #[default]
    LastDay,
    LastWeek,
    All,
}

impl TimeWindow {
    pub fn span(self) -> Option<Duration> {
        match self {
            TimeWindow::LastHour => Some(Duration::hours(1)),
            TimeWindow::LastDay => Some(Duration::hours(24)),
            TimeWindow::LastWeek => Some(Duration::days(7)),
            TimeWindow::All => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TimeWindow::LastHour => "1h",
            TimeWindow::LastDay => "24h",
            TimeWindow::LastWeek => "7d",
            TimeWindow::All => "all",
        }
    }
}

impl FromStr for TimeWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1h" => Ok(TimeWindow::LastHour),
            "24h" => Ok(TimeWindow::LastDay),
            "7d" => Ok(TimeWindow::LastWeek),
            "all" => Ok(TimeWindow::All),
            other => Err(format!("unknown time window '{other}' (expected 1h, 24h, 7d, all)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Recent,
    Oldest,
    Name,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "recent" => Ok(SortOrder::Recent),
            "oldest" => Ok(SortOrder::Oldest),
            "name" => Ok(SortOrder::Name),
            other => Err(format!("unknown sort order '{other}' (expected recent, oldest, name)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalyticsMode {
    #[default]
    Personal,
    Team,
}

impl AnalyticsMode {
    /// Number of rows surfaced to the presentation layer.
    pub fn display_cap(self) -> usize {
        match self {
            AnalyticsMode::Personal => 10,
            AnalyticsMode::Team => 20,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalyticsFilters {
    pub status: StatusFilter,
    pub window: TimeWindow,
    /// Exact match on the script's category field. `all` matches everything.
    pub category: Option<String>,
    /// Team mode only; ignored for personal rows. `all` matches everything.
    pub user: Option<String>,
}

/// The selected value, unless it is absent or the literal `all`.
fn narrowing(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().eq_ignore_ascii_case("all"))
}

impl AnalyticsFilters {
    fn accepts(
        &self,
        row: &LogRow,
        catalog: &Catalog,
        mode: AnalyticsMode,
        now: OffsetDateTime,
    ) -> bool {
        if !self.status.accepts(row.entry.status) {
            return false;
        }
        if let Some(span) = self.window.span() {
            if !clock::within(&row.entry.timestamp, span, now) {
                return false;
            }
        }
        if let Some(category) = narrowing(self.category.as_deref()) {
            // Rows for scripts the catalog no longer knows pass unconditionally.
            if let Some(script) = catalog.find(row.script_id) {
                if script.category != category {
                    return false;
                }
            }
        }
        if mode == AnalyticsMode::Team {
            if let Some(user) = narrowing(self.user.as_deref()) {
                if row.username.as_deref() != Some(user) {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub rows: Vec<LogRow>,
    pub total_executions: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub success_rate_pct: f64,
}

impl AnalyticsReport {
    pub fn success_rate_label(&self) -> String {
        metrics::format_success_rate(self.success_rate_pct, self.total_executions)
    }
}

/// Name used for sorting and display: catalog name, else the raw log message.
pub fn row_display_name<'a>(row: &'a LogRow, catalog: &'a Catalog) -> &'a str {
    catalog
        .display_name(row.script_id)
        .unwrap_or(&row.entry.message)
}

fn sort_rows(rows: &mut [LogRow], catalog: &Catalog, sort: SortOrder) {
    match sort {
        SortOrder::Recent => {
            rows.sort_by_key(|r| std::cmp::Reverse(clock::sort_key(&r.entry.timestamp)))
        }
        SortOrder::Oldest => rows.sort_by_key(|r| clock::sort_key(&r.entry.timestamp)),
        SortOrder::Name => rows.sort_by(|a, b| {
            row_display_name(a, catalog)
                .to_lowercase()
                .cmp(&row_display_name(b, catalog).to_lowercase())
        }),
    }
}

pub fn aggregate(
    rows: Vec<LogRow>,
    catalog: &Catalog,
    filters: &AnalyticsFilters,
    sort: SortOrder,
    mode: AnalyticsMode,
    now: OffsetDateTime,
) -> AnalyticsReport {
    let mut filtered: Vec<LogRow> = rows
        .into_iter()
        .filter(|row| filters.accepts(row, catalog, mode, now))
        .collect();

    let counts = metrics::compute_outcome_counts(filtered.iter().map(|r| r.entry.status));
    let success_rate_pct = metrics::compute_success_rate(counts.success, counts.total);

    // Keep the newest rows, then present them in the requested order.
    sort_rows(&mut filtered, catalog, SortOrder::Recent);
    filtered.truncate(mode.display_cap());
    if sort != SortOrder::Recent {
        sort_rows(&mut filtered, catalog, sort);
    }

    tracing::debug!(
        total = counts.total,
        success = counts.success,
        error = counts.error,
        shown = filtered.len(),
        "analytics aggregated"
    );

    AnalyticsReport {
        rows: filtered,
        total_executions: counts.total,
        success_count: counts.success,
        error_count: counts.error,
        success_rate_pct,
    }
}
