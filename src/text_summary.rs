//! Text summary builders for CLI output.
//!
//! Each builder formats human-readable lines for one command; JSON output bypasses this module.

use crate::analytics::{row_display_name, AnalyticsMode, AnalyticsReport};
use crate::catalog::{Catalog, CategoryBucket};
use crate::model::{
    FileDescriptor, LogEntry, RunState, Script, ScriptCategory, ScriptId, ScriptLogs,
};
use crate::parser::{OutputView, ParsedTable};
use crate::poller::{format_size, is_recent};
use crate::preferences::RecentScript;
use time::OffsetDateTime;

/// Entries shown per script in the log view.
const LOG_VIEW_LIMIT: usize = 10;
const OUTPUT_PREVIEW_CHARS: usize = 500;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn status_marker(entry: &LogEntry) -> &'static str {
    match entry.status {
        crate::model::LogStatus::Success => "OK  ",
        crate::model::LogStatus::Error => "FAIL",
        crate::model::LogStatus::Warning => "WARN",
    }
}

/// Scripts grouped by category bucket, in bucket order. Favorites are starred.
pub(crate) fn build_scripts_summary(scripts: &[&Script], favorites: &[ScriptId]) -> TextSummary {
    let mut lines = Vec::new();
    for bucket in CategoryBucket::ALL {
        let in_bucket: Vec<&&Script> = scripts
            .iter()
            .filter(|s| CategoryBucket::of(&s.category) == bucket)
            .collect();
        if in_bucket.is_empty() {
            continue;
        }
        lines.push(format!("== {} ==", bucket.title()));
        for s in in_bucket {
            let star = if favorites.contains(&s.id) { "*" } else { " " };
            lines.push(format!("{star} [{:>3}] {} ({})", s.id, s.name, s.file));
            if !s.description.is_empty() {
                lines.push(format!("        {}", s.description));
            }
            for input in &s.inputs {
                let mut detail = format!("        --input {}=<{}>", input.key, input.kind.as_str());
                if !input.options.is_empty() {
                    detail.push_str(&format!(" one of [{}]", input.options.join(", ")));
                }
                if let Some(d) = input.default.as_deref() {
                    detail.push_str(&format!(" default {d}"));
                }
                lines.push(detail);
            }
        }
    }
    if lines.is_empty() {
        lines.push("No scripts found.".into());
    }
    TextSummary { lines }
}

pub(crate) fn build_categories_summary(categories: &[ScriptCategory]) -> TextSummary {
    let lines = categories
        .iter()
        .map(|c| format!("{:<20} {:>3} scripts  {}", c.id, c.script_count, c.description))
        .collect();
    TextSummary { lines }
}

fn render_table(table: &ParsedTable) -> Vec<String> {
    let columns = table
        .rows
        .iter()
        .map(Vec::len)
        .chain(std::iter::once(table.headers.len()))
        .max()
        .unwrap_or(0);
    let mut widths = vec![0usize; columns];
    for row in std::iter::once(&table.headers).chain(table.rows.iter()) {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let fmt_row = |row: &[String]| {
        widths
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let cell = row.get(i).map(String::as_str).unwrap_or("");
                format!("{cell:<w$}", w = *w)
            })
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };
    let mut out = vec![fmt_row(&table.headers)];
    out.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    out.extend(table.rows.iter().map(|r| fmt_row(r)));
    out
}

fn render_files(files: &[FileDescriptor], now: OffsetDateTime) -> Vec<String> {
    files
        .iter()
        .map(|f| {
            let size = f.size.map(format_size).unwrap_or_else(|| "-".into());
            let modified = f.modified.as_deref().unwrap_or("-");
            let fresh = if is_recent(f, now) { " (new)" } else { "" };
            format!("  {}  {size}  {modified}{fresh}  -> {}", f.name, f.download_path())
        })
        .collect()
}

/// Outcome of one run with its best available output view.
pub(crate) fn build_run_summary(
    script: &Script,
    state: &RunState,
    entry: &LogEntry,
    now: OffsetDateTime,
) -> TextSummary {
    let mut lines = vec![format!(
        "{} {} [{}]: {}",
        status_marker(entry),
        script.name,
        entry.timestamp,
        entry.message
    )];

    let view = state
        .parsed
        .as_ref()
        .and_then(|p| p.views().into_iter().next());
    match view {
        Some(OutputView::Table(t)) if !t.is_empty() => {
            lines.extend(render_table(t));
        }
        Some(OutputView::Json(values)) => {
            for v in values {
                let pretty = serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string());
                lines.push(pretty);
            }
        }
        Some(OutputView::Plain(_)) | Some(OutputView::Table(_)) | None => {
            lines.extend(state.current_output.lines().map(str::to_string));
        }
    }
    if state.has_table_output && !matches!(view, Some(OutputView::Table(_))) {
        lines.push("(output contains a table)".into());
    }
    if !state.current_files.is_empty() {
        lines.push("Files:".into());
        lines.extend(render_files(&state.current_files, now));
    }
    TextSummary { lines }
}

fn preview(output: &str) -> String {
    let mut chars = output.chars();
    let head: String = chars.by_ref().take(OUTPUT_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Last entries per script with truncated output previews.
pub(crate) fn build_logs_summary(logs: &ScriptLogs, catalog: &Catalog) -> TextSummary {
    let mut lines = Vec::new();
    for (id, entries) in logs {
        if entries.is_empty() {
            continue;
        }
        let name = catalog
            .display_name(*id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Script {id}"));
        lines.push(format!("== {name} ({} runs) ==", entries.len()));
        let skip = entries.len().saturating_sub(LOG_VIEW_LIMIT);
        for entry in &entries[skip..] {
            lines.push(format!(
                "{} {}  {}",
                status_marker(entry),
                entry.timestamp,
                entry.message
            ));
            if let Some(out) = entry.output.as_deref().filter(|o| !o.is_empty()) {
                for l in preview(out).lines() {
                    lines.push(format!("    {l}"));
                }
                if crate::orchestrator::offers_table_view(out) {
                    lines.push("    (table output available)".into());
                }
            }
            for f in &entry.files {
                lines.push(format!("    file: {}", f.name));
            }
        }
    }
    if lines.is_empty() {
        lines.push("No executions in this window.".into());
    }
    TextSummary { lines }
}

pub(crate) fn build_analytics_summary(
    report: &AnalyticsReport,
    catalog: &Catalog,
    mode: AnalyticsMode,
) -> TextSummary {
    let mut lines = vec![
        format!("Total executions: {}", report.total_executions),
        format!("Successful:       {}", report.success_count),
        format!("Failed:           {}", report.error_count),
        format!("Success rate:     {}%", report.success_rate_label()),
    ];
    if report.rows.is_empty() {
        lines.push("No executions match the current filters.".into());
        return TextSummary { lines };
    }
    lines.push(String::new());
    for row in &report.rows {
        let who = match (mode, row.username.as_deref()) {
            (AnalyticsMode::Team, Some(u)) => format!("{u:<10} "),
            _ => String::new(),
        };
        lines.push(format!(
            "{} {who}{}  {}  {}",
            status_marker(&row.entry),
            row.entry.timestamp,
            row_display_name(row, catalog),
            row.entry.message
        ));
    }
    TextSummary { lines }
}

pub(crate) fn build_recent_summary(recent: &[RecentScript]) -> TextSummary {
    if recent.is_empty() {
        return TextSummary {
            lines: vec!["No scripts run in the last 7 days.".into()],
        };
    }
    let lines = recent
        .iter()
        .map(|r| {
            format!(
                "[{:>3}] {:<30} {:<8} {}",
                r.script.id,
                r.script.name,
                r.status.as_str(),
                r.last_run
            )
        })
        .collect();
    TextSummary { lines }
}

pub(crate) fn build_files_summary(
    files: &[FileDescriptor],
    recent_only: bool,
    now: OffsetDateTime,
) -> TextSummary {
    let shown: Vec<FileDescriptor> = files
        .iter()
        .filter(|f| !recent_only || is_recent(f, now))
        .cloned()
        .collect();
    if shown.is_empty() {
        return TextSummary {
            lines: vec!["No files.".into()],
        };
    }
    TextSummary {
        lines: render_files(&shown, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::script;
    use crate::model::LogStatus;

    fn entry(output: Option<String>) -> LogEntry {
        LogEntry {
            timestamp: "2024-05-01T10:00:00".into(),
            status: LogStatus::Success,
            message: "done".into(),
            files: vec![],
            output,
        }
    }

    #[test]
    fn log_view_keeps_last_ten_and_truncates_output() {
        let mut entries: Vec<_> = (0..12).map(|_| entry(None)).collect();
        entries[11] = entry(Some("x".repeat(600)));
        let logs = ScriptLogs::from([(1, entries)]);
        let catalog = Catalog::new(vec![script(1, "Backup", "Maintenance")], vec![]);
        let summary = build_logs_summary(&logs, &catalog);

        assert_eq!(summary.lines[0], "== Backup (12 runs) ==");
        let runs = summary.lines.iter().filter(|l| l.contains("done")).count();
        assert_eq!(runs, 10);
        let preview_line = summary.lines.last().unwrap();
        assert!(preview_line.ends_with("..."));
        assert_eq!(preview_line.trim().chars().count(), 503);
    }

    #[test]
    fn table_renders_aligned_columns() {
        let table = ParsedTable {
            headers: vec!["Name".into(), "Count".into()],
            rows: vec![vec!["a".into(), "10".into()], vec!["long".into(), "2".into()]],
        };
        let lines = render_table(&table);
        assert_eq!(lines[0], "Name | Count");
        assert_eq!(lines[1], "-----+------");
        assert_eq!(lines[2], "a    | 10");
    }

    #[test]
    fn analytics_empty_report_shows_zero_rate() {
        let report = AnalyticsReport {
            rows: vec![],
            total_executions: 0,
            success_count: 0,
            error_count: 0,
            success_rate_pct: 0.0,
        };
        let catalog = Catalog::default();
        let s = build_analytics_summary(&report, &catalog, AnalyticsMode::Personal);
        assert!(s.lines.contains(&"Success rate:     0%".to_string()));
    }
}
