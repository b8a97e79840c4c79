//! Periodic artifact listing per script.
//!
//! Each tick walks the catalog sequentially and replaces every script's file list wholesale.
//! Ticks are not serialised against each other: a slow tick can still be in flight when the
//! next one starts. Every request carries a ticket drawn before it is sent, and a listing is
//! applied only if its ticket is newer than the one already applied for that script.

use crate::api::ScriptApi;
use crate::catalog::Catalog;
use crate::clock;
use crate::error::ConsoleError;
use crate::model::{ConsoleEvent, FileDescriptor, ScriptId};
use crate::session::{self, SessionContext};
use crate::snapshot::Versioned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedSender;

/// Files modified within this span of evaluation time count as recent.
pub const RECENT_FILE_WINDOW: time::Duration = time::Duration::hours(24);

pub struct FilePoller {
    api: Arc<dyn ScriptApi>,
    session: SessionContext,
    script_ids: Vec<ScriptId>,
    interval: Duration,
    next_ticket: AtomicU64,
    cache: Mutex<HashMap<ScriptId, Versioned<Vec<FileDescriptor>>>>,
    event_tx: Option<UnboundedSender<ConsoleEvent>>,
}

impl FilePoller {
    /// Polling needs a live session and at least one script to track.
    pub fn new(
        api: Arc<dyn ScriptApi>,
        session: SessionContext,
        catalog: &Catalog,
        interval: Duration,
    ) -> Result<Self, ConsoleError> {
        if catalog.is_empty() || session.is_closed() {
            return Err(ConsoleError::PollerNotReady);
        }
        Ok(Self {
            api,
            session,
            script_ids: catalog.ids(),
            interval,
            next_ticket: AtomicU64::new(1),
            cache: Mutex::new(HashMap::new()),
            event_tx: None,
        })
    }

    pub fn with_events(mut self, tx: UnboundedSender<ConsoleEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn issue_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    /// Fetch one script's listing. Returns whether the response was applied.
    pub async fn poll_script(&self, script_id: ScriptId) -> bool {
        let ticket = self.issue_ticket();
        let files = match self
            .api
            .list_files(self.session.username(), script_id)
            .await
        {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(script_id, error = %e, "file listing failed");
                return false;
            }
        };
        let count = files.len();
        let applied = {
            let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            cache
                .entry(script_id)
                .or_default()
                .replace_if_newer(ticket, files)
        };
        if applied {
            if let Some(tx) = &self.event_tx {
                let _ = tx.send(ConsoleEvent::FilesUpdated { script_id, count });
            }
        } else {
            tracing::debug!(script_id, ticket, "discarding stale file listing");
        }
        applied
    }

    /// One sequential pass over every tracked script.
    pub async fn poll_once(&self) -> usize {
        let mut applied = 0;
        for id in &self.script_ids {
            if self.session.is_closed() {
                break;
            }
            if self.poll_script(*id).await {
                applied += 1;
            }
        }
        applied
    }

    pub fn files(&self, script_id: ScriptId) -> Versioned<Vec<FileDescriptor>> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.get(&script_id).cloned().unwrap_or_default()
    }

    /// Cached files that are recent as of `now`; recomputed on every call.
    pub fn recent_files(&self, script_id: ScriptId, now: OffsetDateTime) -> Vec<FileDescriptor> {
        self.files(script_id)
            .value()
            .iter()
            .filter(|f| is_recent(f, now))
            .cloned()
            .collect()
    }

    /// Poll on a fixed interval until the session is torn down.
    ///
    /// Each tick runs in its own task so a slow pass never delays the next tick.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let shutdown = session::closed(self.session.shutdown_signal());
            tokio::pin!(shutdown);
            let mut passes = tokio::task::JoinSet::new();
            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        tracing::debug!("file poller stopping on session teardown");
                        break;
                    }
                    _ = ticker.tick() => {
                        let poller = Arc::clone(&self);
                        passes.spawn(async move { poller.poll_once().await });
                    }
                    Some(done) = passes.join_next(), if !passes.is_empty() => {
                        if let Err(e) = done {
                            tracing::warn!(error = %e, "file poll pass failed");
                        }
                    }
                }
            }
            passes.abort_all();
        })
    }
}

pub fn is_recent(file: &FileDescriptor, now: OffsetDateTime) -> bool {
    file.modified
        .as_deref()
        .map(|m| clock::within(m, RECENT_FILE_WINDOW, now))
        .unwrap_or(false)
}

/// Human-readable size in binary units, up to GB, trailing zeros dropped.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rendered = format!("{value:.2}");
    let rendered = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{rendered} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::{script, FakeApi};
    use crate::session::{roster, SessionContext};
    use time::macros::datetime;

    fn file(name: &str, modified: Option<&str>) -> FileDescriptor {
        FileDescriptor {
            name: name.into(),
            path: format!("out/{name}"),
            size: Some(10),
            modified: modified.map(str::to_string),
            kind: None,
        }
    }

    fn admin() -> SessionContext {
        SessionContext::new(roster().remove(0))
    }

    fn catalog(ids: &[ScriptId]) -> Catalog {
        Catalog::new(
            ids.iter()
                .map(|i| script(*i, &format!("S{i}"), "Reporting"))
                .collect(),
            vec![],
        )
    }

    #[test]
    fn refuses_to_start_without_catalog() {
        let api: Arc<dyn ScriptApi> = Arc::new(FakeApi::default());
        let empty = Catalog::default();
        let res = FilePoller::new(api, admin(), &empty, Duration::from_secs(10));
        assert!(matches!(res, Err(ConsoleError::PollerNotReady)));
    }

    #[tokio::test]
    async fn listing_is_replaced_wholesale() {
        let api = Arc::new(FakeApi::default());
        api.queue_files(1, Duration::ZERO, vec![file("a.csv", None), file("b.csv", None)]);
        api.queue_files(1, Duration::ZERO, vec![file("c.csv", None)]);
        let poller =
            FilePoller::new(api.clone(), admin(), &catalog(&[1, 2]), Duration::from_secs(10))
                .unwrap();

        assert_eq!(poller.poll_once().await, 2);
        assert_eq!(poller.files(1).value().len(), 2);
        poller.poll_once().await;
        let names: Vec<_> = poller
            .files(1)
            .value()
            .iter()
            .map(|f| f.name.clone())
            .collect();
        assert_eq!(names, vec!["c.csv"]);
        assert!(poller.files(2).value().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_from_older_request_is_discarded() {
        let api = Arc::new(FakeApi::default());
        api.queue_files(1, Duration::from_secs(5), vec![file("old.csv", None)]);
        api.queue_files(1, Duration::from_millis(10), vec![file("new.csv", None)]);
        let scripts = catalog(&[1]);
        let interval = Duration::from_secs(10);
        let poller = Arc::new(FilePoller::new(api.clone(), admin(), &scripts, interval).unwrap());

        let slow = tokio::spawn({
            let p = Arc::clone(&poller);
            async move { p.poll_script(1).await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*api.file_calls.lock().unwrap(), 1);
        let fast = poller.poll_script(1).await;
        let slow = slow.await.unwrap();

        assert!(fast);
        assert!(!slow);
        assert_eq!(poller.files(1).value()[0].name, "new.csv");
    }

    #[test]
    fn recency_is_evaluated_at_read_time() {
        let now = datetime!(2024-05-10 12:00 UTC);
        let fresh = file("fresh", Some("2024-05-10T01:00:00Z"));
        let stale = file("stale", Some("2024-05-08T12:00:00Z"));
        let unknown = file("unknown", None);
        assert!(is_recent(&fresh, now));
        assert!(!is_recent(&stale, now));
        assert!(!is_recent(&unknown, now));
        assert!(!is_recent(&fresh, now + time::Duration::days(1)));
    }

    #[tokio::test]
    async fn recent_files_filters_cached_listing() {
        let api = Arc::new(FakeApi::default());
        api.queue_files(
            1,
            Duration::ZERO,
            vec![
                file("fresh", Some("2024-05-10T01:00:00Z")),
                file("stale", Some("2024-05-01T01:00:00Z")),
            ],
        );
        let poller =
            FilePoller::new(api, admin(), &catalog(&[1]), Duration::from_secs(10)).unwrap();
        poller.poll_once().await;
        let recent = poller.recent_files(1, datetime!(2024-05-10 12:00 UTC));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].name, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_poller_stops_on_teardown() {
        let api = Arc::new(FakeApi::default());
        api.queue_files(1, Duration::ZERO, vec![file("a", None)]);
        let session = admin();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let scripts = catalog(&[1]);
        let interval = Duration::from_secs(10);
        let poller = FilePoller::new(api.clone(), session.clone(), &scripts, interval).unwrap();
        let poller = Arc::new(poller.with_events(tx));
        let handle = Arc::clone(&poller).spawn();

        match rx.recv().await {
            Some(ConsoleEvent::FilesUpdated { script_id, count }) => {
                assert_eq!((script_id, count), (1, 1));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        session.teardown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller exits")
            .unwrap();
        let calls = *api.file_calls.lock().unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*api.file_calls.lock().unwrap(), calls);
    }

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(format_size(0), "0 Bytes");
        assert_eq!(format_size(512), "512 Bytes");
        assert_eq!(format_size(1024), "1 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 * 1024), "3072 GB");
    }
}
