//! Post-run processing.
//!
//! Turns whatever came back from a run request (a reply, a transport failure, or nothing
//! before the deadline) into the visible output, parsed views, and the log entry for it.

use crate::api::RunReply;
use crate::clock;
use crate::error::ApiError;
use crate::model::{FileDescriptor, LogEntry, LogStatus, RunOutcome, RunPhase};
use crate::parser::{self, ParsedOutput};
use std::time::Duration;

pub(crate) const START_BANNER: &str = "Starting script execution...\n";
pub(crate) const STOP_MARKER: &str = "\n\n=== SCRIPT STOPPED BY USER ===\n";
pub(crate) const STOPPED_MESSAGE: &str = "Script stopped by user";
const EMPTY_SUCCESS_OUTPUT: &str = "Script completed successfully.";
const DEFAULT_SUCCESS_MESSAGE: &str = "Script executed successfully";
const TRANSPORT_FAILURE: &str = "Failed to execute script";

/// How a run request ended, before any interpretation.
#[derive(Debug)]
pub(crate) enum RunCompletion {
    Reply(RunReply),
    Failed(ApiError),
    TimedOut(Duration),
}

/// Result of post-run processing, ready to apply to run state.
#[derive(Debug, Clone)]
pub(crate) struct ProcessedRun {
    pub phase: RunPhase,
    pub entry: LogEntry,
    pub output: String,
    pub files: Vec<FileDescriptor>,
    pub has_table_output: bool,
    pub parsed: ParsedOutput,
}

/// Table affordance check on the raw log: explicit sentinels or the glyph heuristic.
pub(crate) fn offers_table_view(log: &str) -> bool {
    log.contains(parser::TABLE_BEGIN) || parser::looks_like_table(log)
}

pub(crate) fn process_run_completion(completion: RunCompletion) -> ProcessedRun {
    match completion {
        RunCompletion::Reply(reply) => process_reply(reply),
        RunCompletion::Failed(e) => {
            let output = format!("ERROR: {TRANSPORT_FAILURE}\n{e}");
            failed(
                RunPhase::Completed(RunOutcome::Error),
                TRANSPORT_FAILURE.to_string(),
                output,
            )
        }
        RunCompletion::TimedOut(after) => {
            let message = format!(
                "No response within {}; remote outcome unknown",
                humantime::format_duration(after)
            );
            let output = format!("ERROR: {message}");
            failed(RunPhase::TimedOut, message, output)
        }
    }
}

fn failed(phase: RunPhase, message: String, output: String) -> ProcessedRun {
    ProcessedRun {
        phase,
        entry: LogEntry {
            timestamp: clock::timestamp_now(),
            status: LogStatus::Error,
            message,
            files: Vec::new(),
            output: None,
        },
        parsed: parser::parse(&output),
        output,
        files: Vec::new(),
        has_table_output: false,
    }
}

fn process_reply(reply: RunReply) -> ProcessedRun {
    let http_ok = reply.is_http_success();
    let success = http_ok && reply.body.is_success_status();
    let remote_message = reply.body.remote_message();
    let log = reply.body.execution_log.unwrap_or_default();

    let reason = remote_message.as_deref().unwrap_or("Unknown error").to_string();
    let (message, output) = if !http_ok {
        // A failed HTTP call carries no usable log; only the reason is shown.
        (
            format!("HTTP {}: {reason}", reply.http_status),
            format!("ERROR: {reason}"),
        )
    } else {
        let message = match (success, remote_message) {
            (_, Some(m)) => m,
            (true, None) => DEFAULT_SUCCESS_MESSAGE.to_string(),
            (false, None) => TRANSPORT_FAILURE.to_string(),
        };
        let output = if !log.is_empty() {
            log.clone()
        } else if success {
            EMPTY_SUCCESS_OUTPUT.to_string()
        } else {
            format!("ERROR: {message}")
        };
        (message, output)
    };

    let (status, outcome) = if success {
        (LogStatus::Success, RunOutcome::Success)
    } else {
        (LogStatus::Error, RunOutcome::Error)
    };

    ProcessedRun {
        phase: RunPhase::Completed(outcome),
        entry: LogEntry {
            timestamp: clock::timestamp_now(),
            status,
            message,
            files: reply.body.files.clone(),
            output: Some(log.clone()),
        },
        parsed: parser::parse(&log),
        has_table_output: offers_table_view(&log),
        files: reply.body.files,
        output,
    }
}
