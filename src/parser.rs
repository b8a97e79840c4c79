//! Execution-log parsing.
//!
//! A script's execution log is one unstructured string. Scripts may embed structured payloads
//! in it between sentinel markers, or print box-drawn tables directly. `parse` extracts every
//! view it can find and never fails: a malformed block just leaves its view absent.

use serde::Serialize;
use serde_json::Value;

pub const TABLE_BEGIN: &str = "### TABLE_OUTPUT_BEGIN ###";
pub const TABLE_END: &str = "### TABLE_OUTPUT_END ###";
pub const JSON_BEGIN: &str = "### JSON_OUTPUT_BEGIN ###";
pub const JSON_END: &str = "### JSON_OUTPUT_END ###";

const VERTICAL: char = '│';
const DOUBLE_RULE: char = '═';
const SINGLE_RULE: char = '─';

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ParsedTable {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedOutput {
    pub plain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<ParsedTable>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Vec<Value>>,
}

/// One renderable view of a parsed execution log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputView<'a> {
    Plain(&'a str),
    Table(&'a ParsedTable),
    Json(&'a [Value]),
}

impl ParsedOutput {
    /// Available views, structured ones first.
    pub fn views(&self) -> Vec<OutputView<'_>> {
        let mut views = Vec::with_capacity(3);
        if let Some(t) = &self.table {
            views.push(OutputView::Table(t));
        }
        if let Some(j) = &self.json {
            views.push(OutputView::Json(j));
        }
        views.push(OutputView::Plain(&self.plain));
        views
    }
}

/// Heuristic for box-drawn tables printed without sentinels.
pub fn looks_like_table(raw: &str) -> bool {
    raw.contains('+')
        && raw.contains(VERTICAL)
        && (raw.contains(DOUBLE_RULE) || raw.contains(SINGLE_RULE))
}

/// Contents between the first `begin` marker and the next `end` marker after it.
fn sentinel_region<'a>(raw: &'a str, begin: &str, end: &str) -> Option<&'a str> {
    let start = raw.find(begin)? + begin.len();
    let len = raw[start..].find(end)?;
    Some(&raw[start..start + len])
}

/// Remove every complete sentinel block from `raw`.
fn strip_region(raw: &str, begin: &str, end: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(b) = rest.find(begin) {
        match rest[b..].find(end) {
            Some(e) => {
                out.push_str(&rest[..b]);
                rest = &rest[b + e + end.len()..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

fn split_cells(line: &str) -> Vec<String> {
    line.split(VERTICAL)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a box-drawn table. The first line is a border; the first line after it holding a
/// vertical bar is the header, followed by its own separator line.
pub fn parse_table(text: &str) -> ParsedTable {
    let lines: Vec<&str> = text.trim().split('\n').collect();
    if lines.len() < 3 {
        return ParsedTable::default();
    }

    let Some(header_idx) = (1..lines.len()).find(|&i| lines[i].contains(VERTICAL)) else {
        return ParsedTable::default();
    };
    let headers = split_cells(lines[header_idx]);

    let rows = lines
        .iter()
        .skip(header_idx + 2)
        .filter(|l| {
            l.contains(VERTICAL) && !l.contains(DOUBLE_RULE) && !l.contains(SINGLE_RULE)
        })
        .map(|l| split_cells(l))
        .filter(|r| !r.is_empty())
        .collect();

    ParsedTable { headers, rows }
}

fn parse_json_block(block: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(block.trim()) {
        Ok(Value::Array(items)) => Some(items),
        Ok(other) => Some(vec![other]),
        Err(e) => {
            tracing::debug!(error = %e, "discarding malformed JSON output block");
            None
        }
    }
}

/// Extract every view from a raw execution log. Pure and idempotent.
pub fn parse(raw: &str) -> ParsedOutput {
    let table_source = match sentinel_region(raw, TABLE_BEGIN, TABLE_END) {
        Some(region) => Some(region),
        None if looks_like_table(raw) => Some(raw),
        None => None,
    };
    let table = table_source
        .map(parse_table)
        .filter(|t| !t.headers.is_empty());

    let json = sentinel_region(raw, JSON_BEGIN, JSON_END).and_then(parse_json_block);

    let without_table = strip_region(raw, TABLE_BEGIN, TABLE_END);
    let plain = strip_region(&without_table, JSON_BEGIN, JSON_END)
        .trim_end()
        .to_string();

    ParsedOutput { plain, table, json }
}
