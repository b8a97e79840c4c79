use crate::analytics::{
    self, AnalyticsFilters, AnalyticsMode, LogRow, SortOrder, StatusFilter, TimeWindow,
};
use crate::api::{HttpScriptApi, ScriptApi};
use crate::catalog::{Catalog, CategoryBucket};
use crate::clock;
use crate::error::ConsoleError;
use crate::logstore::LogStore;
use crate::model::{
    ConsoleConfig, ConsoleEvent, FileDescriptor, LogEntry, RunOutcome, RunPhase, ScriptId,
};
use crate::orchestrator::RunOrchestrator;
use crate::parser::ParsedOutput;
use crate::poller::FilePoller;
use crate::preferences::{self, PreferenceTracker};
use crate::session::{Permission, SessionContext, SessionStore, DEFAULT_TEAM_ROSTER};
use crate::storage::{self, FileKvStore, KvStore};
use crate::text_summary::{self, TextSummary};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "scriptdeck",
    version,
    about = "Launch remote scripts, track their runs, and analyze execution history"
)]
pub struct Cli {
    /// Base URL of the script execution service
    #[arg(long, global = true, default_value = "http://localhost:8000")]
    pub base_url: String,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// File listing poll interval
    #[arg(long, global = true, default_value = "10s")]
    pub poll_interval: humantime::Duration,

    /// Give up waiting for a run reply after this long
    #[arg(long, global = true, default_value = "15m")]
    pub run_timeout: humantime::Duration,

    /// Timeout for catalog, log, and file requests
    #[arg(long, global = true, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Directory holding the session and favorites state
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Team analytics roster (repeatable; defaults to admin, developer, viewer)
    #[arg(long = "team-user", global = true)]
    pub team_users: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Log in as one of the known users
    Login { username: String },
    /// Forget the stored identity
    Logout,
    /// Show the current identity and permissions
    Whoami,
    /// List scripts, grouped by category
    Scripts {
        /// Category bucket slug (e.g. data-collection, monitoring, other)
        #[arg(long)]
        category: Option<String>,
        /// Match against name, description, or file
        #[arg(long)]
        search: Option<String>,
    },
    /// List script categories
    Categories,
    /// Run a script and wait for its result (Ctrl-C stops it)
    Run {
        id: ScriptId,
        /// Input value as key=value (repeatable)
        #[arg(long = "input", value_parser = parse_key_val)]
        inputs: Vec<(String, String)>,
    },
    /// Ask the service to stop a script
    Stop { id: ScriptId },
    /// Show recent executions per script
    Logs {
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Execution analytics
    Analytics {
        /// Aggregate across the team roster (admin only)
        #[arg(long)]
        team: bool,
        /// all, success, error
        #[arg(long, default_value = "all")]
        status: StatusFilter,
        /// 1h, 24h, 7d, all
        #[arg(long, default_value = "24h")]
        window: TimeWindow,
        /// Exact script category
        #[arg(long)]
        category: Option<String>,
        /// Username (team mode only)
        #[arg(long)]
        user: Option<String>,
        /// recent, oldest, name
        #[arg(long, default_value = "recent")]
        sort: SortOrder,
    },
    /// Scripts run most recently in the last 7 days
    Recent,
    /// Files produced by a script
    Files {
        id: ScriptId,
        /// Only files modified in the last 24 hours
        #[arg(long)]
        recent_only: bool,
    },
    /// Poll file listings for every script until Ctrl-C
    Watch,
    /// Download a produced file
    Download {
        path: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List, check, or toggle favorite scripts
    Favorites {
        #[command(subcommand)]
        action: Option<FavoritesAction>,
    },
    /// Ask the service to reload its script configuration
    Reload,
}

#[derive(Debug, Subcommand, Clone)]
pub enum FavoritesAction {
    List,
    Toggle { id: ScriptId },
    /// Whether a script is a favorite
    Check { id: ScriptId },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if k.trim().is_empty() {
        return Err(format!("empty input key in '{s}'"));
    }
    Ok((k.trim().to_string(), v.to_string()))
}

/// Build a `ConsoleConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> ConsoleConfig {
    let team_roster = if args.team_users.is_empty() {
        DEFAULT_TEAM_ROSTER.iter().map(|u| u.to_string()).collect()
    } else {
        args.team_users.clone()
    };
    ConsoleConfig {
        base_url: args.base_url.clone(),
        user_agent: format!("scriptdeck/{}", env!("CARGO_PKG_VERSION")),
        poll_interval: Duration::from(args.poll_interval),
        run_timeout: Duration::from(args.run_timeout),
        request_timeout: Duration::from(args.request_timeout),
        history_hours: 24,
        team_roster,
        state_dir: args.state_dir.clone(),
    }
}

fn phase_label(phase: RunPhase) -> &'static str {
    match phase {
        RunPhase::Idle => "idle",
        RunPhase::Running => "running",
        RunPhase::Completed(RunOutcome::Success) => "succeeded",
        RunPhase::Completed(RunOutcome::Error) => "failed",
        RunPhase::Stopped => "stopped",
        RunPhase::TimedOut => "timed out",
    }
}

/// Most recent entry the local log holds for a script.
fn last_recorded(store: &LogStore, username: &str, script_id: ScriptId) -> Option<LogEntry> {
    store
        .cached(username)
        .value()
        .get(&script_id)
        .and_then(|entries| entries.last().cloned())
}

/// Rows for the requested analytics scope. Team scope is reserved for admins.
async fn analytics_rows(
    store: &LogStore,
    session: &SessionContext,
    mode: AnalyticsMode,
    roster: &[String],
    hours: u32,
) -> Result<Vec<LogRow>, ConsoleError> {
    match mode {
        AnalyticsMode::Team => {
            if !session.is_admin() {
                return Err(ConsoleError::PermissionDenied {
                    user: session.username().to_string(),
                    permission: "team analytics".into(),
                });
            }
            let team = store.fetch_team(roster, hours).await;
            Ok(analytics::flatten_team(&team))
        }
        AnalyticsMode::Personal => {
            let logs = store.fetch_history(session.username(), hours).await?;
            Ok(analytics::flatten_personal(&logs))
        }
    }
}

/// History to fetch so the chosen window has data to filter.
fn history_hours_for(window: TimeWindow, default_hours: u32) -> u32 {
    match window {
        TimeWindow::LastWeek | TimeWindow::All => preferences::RECENT_WINDOW_HOURS,
        TimeWindow::LastHour | TimeWindow::LastDay => default_hours,
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let state_dir = cfg
        .state_dir
        .clone()
        .unwrap_or_else(storage::default_state_dir);
    let store = FileKvStore::open(&state_dir);
    tracing::debug!(path = %store.path().display(), "using local state");
    let kv: Arc<dyn KvStore> = Arc::new(store);
    let api: Arc<dyn ScriptApi> =
        Arc::new(HttpScriptApi::new(&cfg).context("failed to build HTTP client")?);
    let (out_tx, out_handle) = spawn_output_writer();

    let console = Console {
        json: args.json,
        cfg,
        kv,
        api,
        out: out_tx,
    };
    let res = console.dispatch(args.command).await;

    drop(console);
    let _ = out_handle.await;
    res
}

struct Console {
    json: bool,
    cfg: ConsoleConfig,
    kv: Arc<dyn KvStore>,
    api: Arc<dyn ScriptApi>,
    out: mpsc::UnboundedSender<OutputLine>,
}

#[derive(Serialize)]
struct RunReport<'a> {
    script_id: ScriptId,
    phase: RunPhase,
    entry: &'a LogEntry,
    output: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parsed: Option<&'a ParsedOutput>,
    files: &'a [FileDescriptor],
    has_table_output: bool,
}

impl Console {
    fn stdout(&self, line: impl Into<String>) {
        let _ = self.out.send(OutputLine::Stdout(line.into()));
    }

    fn stderr(&self, line: impl Into<String>) {
        let _ = self.out.send(OutputLine::Stderr(line.into()));
    }

    fn emit_summary(&self, summary: TextSummary) {
        for line in summary.lines {
            self.stdout(line);
        }
    }

    fn emit_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let out = serde_json::to_string_pretty(value)?;
        self.stdout(out);
        Ok(())
    }

    fn session(&self) -> Result<SessionContext> {
        SessionStore::new(self.kv.as_ref())
            .restore()
            .ok_or_else(|| ConsoleError::NotLoggedIn.into())
    }

    async fn catalog(&self) -> Result<Catalog> {
        Catalog::load(self.api.as_ref())
            .await
            .context("failed to load script catalog")
    }

    fn log_store(&self) -> Arc<LogStore> {
        Arc::new(LogStore::new(Arc::clone(&self.api)))
    }

    async fn dispatch(&self, command: Command) -> Result<()> {
        match command {
            Command::Login { username } => self.login(&username),
            Command::Logout => self.logout(),
            Command::Whoami => self.whoami(),
            Command::Scripts { category, search } => {
                self.scripts(category.as_deref(), search.as_deref()).await
            }
            Command::Categories => self.categories().await,
            Command::Run { id, inputs } => self.run_script(id, inputs).await,
            Command::Stop { id } => self.stop_script(id).await,
            Command::Logs { hours } => self.logs(hours).await,
            Command::Analytics {
                team,
                status,
                window,
                category,
                user,
                sort,
            } => {
                let filters = AnalyticsFilters {
                    status,
                    window,
                    category,
                    user,
                };
                let mode = if team {
                    AnalyticsMode::Team
                } else {
                    AnalyticsMode::Personal
                };
                self.analytics(mode, filters, sort).await
            }
            Command::Recent => self.recent().await,
            Command::Files { id, recent_only } => self.files(id, recent_only).await,
            Command::Watch => self.watch().await,
            Command::Download { path, out } => self.download(&path, out).await,
            Command::Favorites { action } => {
                self.favorites(action.unwrap_or(FavoritesAction::List)).await
            }
            Command::Reload => self.reload().await,
        }
    }

    fn login(&self, username: &str) -> Result<()> {
        let session = SessionStore::new(self.kv.as_ref()).login(username)?;
        if self.json {
            return self.emit_json(session.user());
        }
        self.stdout(format!(
            "Logged in as {} ({:?})",
            session.username(),
            session.user().role
        ));
        Ok(())
    }

    fn logout(&self) -> Result<()> {
        let store = SessionStore::new(self.kv.as_ref());
        let session = store.restore();
        store.logout(session.as_ref())?;
        self.stderr("Logged out");
        Ok(())
    }

    fn whoami(&self) -> Result<()> {
        let session = self.session()?;
        if self.json {
            return self.emit_json(session.user());
        }
        let perms: Vec<_> = session
            .user()
            .permissions
            .iter()
            .map(|p| p.as_str())
            .collect();
        self.stdout(format!(
            "{} ({:?}) permissions: {}",
            session.username(),
            session.user().role,
            perms.join(", ")
        ));
        Ok(())
    }

    async fn scripts(&self, category: Option<&str>, search: Option<&str>) -> Result<()> {
        let session = self.session()?;
        let catalog = self.catalog().await?;
        let mut shown = match category {
            Some(slug) => {
                let bucket = CategoryBucket::from_slug(slug)
                    .with_context(|| format!("unknown category '{slug}'"))?;
                catalog.in_bucket(bucket)
            }
            None => catalog.scripts().iter().collect(),
        };
        if let Some(q) = search {
            let hits: Vec<ScriptId> = catalog.search(q).iter().map(|s| s.id).collect();
            shown.retain(|s| hits.contains(&s.id));
        }
        if self.json {
            return self.emit_json(&shown);
        }
        let favorites =
            PreferenceTracker::new(Arc::clone(&self.kv)).list_favorites(session.username());
        self.emit_summary(text_summary::build_scripts_summary(&shown, &favorites));
        Ok(())
    }

    async fn categories(&self) -> Result<()> {
        let catalog = self.catalog().await?;
        if self.json {
            return self.emit_json(&catalog.categories());
        }
        self.emit_summary(text_summary::build_categories_summary(catalog.categories()));
        Ok(())
    }

    fn spawn_event_printer(
        &self,
        mut evt_rx: mpsc::UnboundedReceiver<ConsoleEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let out = self.out.clone();
        tokio::spawn(async move {
            while let Some(ev) = evt_rx.recv().await {
                let line = match ev {
                    ConsoleEvent::RunStarted {
                        script_id,
                        generation,
                    } => format!("Starting script {script_id} (run #{generation})..."),
                    ConsoleEvent::RunFinished {
                        script_id,
                        phase,
                        entry,
                    } => format!(
                        "Script {script_id} {}: {}",
                        phase_label(phase),
                        entry.message
                    ),
                    ConsoleEvent::RunStopped { script_id } => {
                        format!("Script {script_id} stopped by user")
                    }
                    ConsoleEvent::StaleResponse {
                        script_id,
                        generation,
                    } => {
                        format!("Ignoring late reply for script {script_id} (run #{generation})")
                    }
                    ConsoleEvent::FilesUpdated { script_id, count } => {
                        format!("Script {script_id}: {count} file(s)")
                    }
                    ConsoleEvent::Info(info) => info.to_message(),
                };
                let _ = out.send(OutputLine::Stderr(line));
            }
        })
    }

    async fn run_script(&self, id: ScriptId, inputs: Vec<(String, String)>) -> Result<()> {
        let session = self.session()?;
        session.require(Permission::Scripts)?;
        let catalog = self.catalog().await?;
        let script = catalog
            .find(id)
            .cloned()
            .ok_or(ConsoleError::UnknownScript(id))?;

        let (evt_tx, evt_rx) = mpsc::unbounded_channel::<ConsoleEvent>();
        let printer = self.spawn_event_printer(evt_rx);
        let store = self.log_store();
        let orch = RunOrchestrator::new(
            Arc::clone(&self.api),
            session.clone(),
            Arc::clone(&store),
            evt_tx,
            self.cfg.run_timeout,
        );
        for (k, v) in &inputs {
            orch.set_input(id, k, v);
        }
        let handle = orch
            .run(&script)
            .map_err(|reason| ConsoleError::RunRejected {
                script_id: id,
                reason,
            })?;
        tracing::debug!(script_id = id, generation = handle.generation, "waiting for run");

        let entry = tokio::select! {
            entry = handle.wait() => entry,
            _ = tokio::signal::ctrl_c() => {
                let entry = if orch.is_running(id) {
                    orch.stop(id).await
                } else {
                    None
                };
                // Release the in-flight request so the run task ends.
                session.teardown();
                entry
            }
        };
        let state = orch.state(id).unwrap_or_default();
        drop(orch);
        let _ = printer.await;

        // A run that finished just before Ctrl-C still left its entry in the local log.
        let entry = entry.or_else(|| last_recorded(&store, session.username(), id));
        let Some(entry) = entry else {
            anyhow::bail!("script {id} produced no result");
        };
        if self.json {
            return self.emit_json(&RunReport {
                script_id: id,
                phase: state.phase,
                entry: &entry,
                output: &state.current_output,
                parsed: state.parsed.as_ref(),
                files: &state.current_files,
                has_table_output: state.has_table_output,
            });
        }
        self.emit_summary(text_summary::build_run_summary(
            &script,
            &state,
            &entry,
            clock::now(),
        ));
        Ok(())
    }

    async fn stop_script(&self, id: ScriptId) -> Result<()> {
        let session = self.session()?;
        session.require(Permission::Scripts)?;
        let (evt_tx, evt_rx) = mpsc::unbounded_channel::<ConsoleEvent>();
        let printer = self.spawn_event_printer(evt_rx);
        let orch = RunOrchestrator::new(
            Arc::clone(&self.api),
            session,
            self.log_store(),
            evt_tx,
            self.cfg.run_timeout,
        );
        orch.stop(id).await;
        drop(orch);
        let _ = printer.await;
        Ok(())
    }

    async fn logs(&self, hours: u32) -> Result<()> {
        let session = self.session()?;
        session.require(Permission::Logs)?;
        let logs = self
            .log_store()
            .fetch_history(session.username(), hours)
            .await
            .context("failed to fetch execution history")?;
        if self.json {
            return self.emit_json(&*logs);
        }
        let catalog = self.catalog().await?;
        self.emit_summary(text_summary::build_logs_summary(&logs, &catalog));
        Ok(())
    }

    async fn analytics(
        &self,
        mode: AnalyticsMode,
        filters: AnalyticsFilters,
        sort: SortOrder,
    ) -> Result<()> {
        let session = self.session()?;
        session.require(Permission::Logs)?;
        let hours = history_hours_for(filters.window, self.cfg.history_hours);
        let rows = analytics_rows(
            &self.log_store(),
            &session,
            mode,
            &self.cfg.team_roster,
            hours,
        )
        .await
        .context("failed to collect execution history")?;
        let catalog = self.catalog().await?;
        let now = clock::now();
        let report = analytics::aggregate(rows, &catalog, &filters, sort, mode, now);
        if self.json {
            return self.emit_json(&report);
        }
        let scope = match mode {
            AnalyticsMode::Personal => session.username().to_string(),
            AnalyticsMode::Team => format!("team of {}", self.cfg.team_roster.len()),
        };
        self.stdout(format!("Analytics for {scope}, window {}", filters.window.label()));
        self.emit_summary(text_summary::build_analytics_summary(&report, &catalog, mode));
        Ok(())
    }

    async fn recent(&self) -> Result<()> {
        let session = self.session()?;
        let logs = self
            .log_store()
            .fetch_history(session.username(), preferences::RECENT_WINDOW_HOURS)
            .await
            .context("failed to fetch execution history")?;
        let catalog = self.catalog().await?;
        let recent = preferences::recent_scripts(&logs, &catalog);
        if self.json {
            let rows: Vec<_> = recent
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "script_id": r.script.id,
                        "name": r.script.name,
                        "last_run": r.last_run,
                        "status": r.status,
                        "message": r.message,
                    })
                })
                .collect();
            return self.emit_json(&rows);
        }
        self.emit_summary(text_summary::build_recent_summary(&recent));
        Ok(())
    }

    async fn files(&self, id: ScriptId, recent_only: bool) -> Result<()> {
        let session = self.session()?;
        let catalog = self.catalog().await?;
        if catalog.find(id).is_none() {
            return Err(ConsoleError::UnknownScript(id).into());
        }
        let poller = FilePoller::new(
            Arc::clone(&self.api),
            session,
            &catalog,
            self.cfg.poll_interval,
        )?;
        poller.poll_script(id).await;
        let now = clock::now();
        let files = if recent_only {
            poller.recent_files(id, now)
        } else {
            poller.files(id).value().to_vec()
        };
        if self.json {
            return self.emit_json(&files);
        }
        self.emit_summary(text_summary::build_files_summary(&files, false, now));
        Ok(())
    }

    async fn watch(&self) -> Result<()> {
        let session = self.session()?;
        let catalog = self.catalog().await?;
        let (evt_tx, evt_rx) = mpsc::unbounded_channel::<ConsoleEvent>();
        let printer = self.spawn_event_printer(evt_rx);
        let poller = Arc::new(
            FilePoller::new(
                Arc::clone(&self.api),
                session.clone(),
                &catalog,
                self.cfg.poll_interval,
            )?
            .with_events(evt_tx),
        );
        let handle = Arc::clone(&poller).spawn();
        self.stderr(format!(
            "Watching {} scripts every {}; Ctrl-C to stop",
            catalog.scripts().len(),
            humantime::format_duration(self.cfg.poll_interval)
        ));

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        session.teardown();
        let _ = handle.await;

        let now = clock::now();
        for script in catalog.scripts() {
            let recent = poller.recent_files(script.id, now);
            if !recent.is_empty() {
                self.stdout(format!("== {} ==", script.name));
                self.emit_summary(text_summary::build_files_summary(&recent, true, now));
            }
        }
        drop(poller);
        let _ = printer.await;
        Ok(())
    }

    async fn download(&self, path: &str, out: Option<PathBuf>) -> Result<()> {
        let session = self.session()?;
        let bytes = self
            .api
            .download_file(session.username(), path)
            .await
            .with_context(|| format!("failed to download {path}"))?;
        let target = out.unwrap_or_else(|| {
            PathBuf::from(path.rsplit(['/', '\\']).next().unwrap_or(path))
        });
        tokio::fs::write(&target, &bytes)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;
        self.stderr(format!(
            "Saved {} ({})",
            target.display(),
            crate::poller::format_size(bytes.len() as u64)
        ));
        Ok(())
    }

    async fn favorites(&self, action: FavoritesAction) -> Result<()> {
        let session = self.session()?;
        let tracker = PreferenceTracker::new(Arc::clone(&self.kv));
        let catalog = self.catalog().await?;
        match action {
            FavoritesAction::List => {
                let favorites = tracker.favorite_scripts(session.username(), &catalog);
                if self.json {
                    return self.emit_json(&favorites);
                }
                if favorites.is_empty() {
                    self.stdout("No favorites yet.");
                }
                for s in favorites {
                    self.stdout(format!("[{:>3}] {}", s.id, s.name));
                }
            }
            FavoritesAction::Check { id } => {
                let script = catalog.find(id).ok_or(ConsoleError::UnknownScript(id))?;
                let favorite = tracker.is_favorite(session.username(), id);
                if self.json {
                    return self.emit_json(&serde_json::json!({
                        "script_id": id,
                        "favorite": favorite,
                    }));
                }
                let verdict = if favorite { "is" } else { "is not" };
                self.stdout(format!("{} {verdict} a favorite", script.name));
            }
            FavoritesAction::Toggle { id } => {
                let script = catalog.find(id).ok_or(ConsoleError::UnknownScript(id))?;
                let now_favorite = tracker.toggle_favorite(session.username(), id)?;
                let line = if now_favorite {
                    format!("Added {} to favorites", script.name)
                } else {
                    format!("Removed {} from favorites", script.name)
                };
                self.stdout(line);
            }
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let session = self.session()?;
        session.require(Permission::Scripts)?;
        let message = self
            .api
            .reload_config()
            .await
            .context("failed to reload configuration")?;
        let catalog = self.catalog().await?;
        self.stdout(format!("{message} ({} scripts)", catalog.scripts().len()));
        Ok(())
    }
}
