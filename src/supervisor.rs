//! Worker process lifecycle
//!
//! The [`Supervisor`] owns one slot per profile. A slot is reserved
//! (`Starting`) under the slot lock before any slow work happens, so two
//! concurrent starts of the same profile cannot both spawn a worker. Once
//! spawned, the child process is owned by an exit watcher task; the slot only
//! holds channels to it.
//!
//! Each worker gets:
//! - a stdout reader (lines logged at INFO),
//! - a stderr reader (lines classified with [`detect_log_level`]),
//! - an exit watcher that removes the scratch config and releases the slot.

use crate::config::WorkerSettings;
use crate::db::{ProfileStatus, Store};
use crate::error::{storage_message, SupervisorError};
use crate::logs::{detect_log_level, LogAggregator, LogLevel, LogSource};
use crate::resolver::ExecutableResolver;
use crate::timeline::{format_duration, EventStatus, EventType, TimelineEventLog};
use crate::worker_config::{ConfigVariant, ScratchConfig, WorkerConfigBuilder};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Actor recorded on timeline events raised by lifecycle calls
const ACTOR: &str = "admin";

/// Knobs for the supervisor, usually taken from `[worker]`
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub command: String,
    pub scratch_dir: PathBuf,
    pub variant: ConfigVariant,
    /// Time between SIGINT and kill during `close_all`
    pub shutdown_grace: Duration,
    /// Upper bound on waiting for a killed worker to be reaped
    pub stop_timeout: Duration,
}

impl SupervisorOptions {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            command: settings.command.clone(),
            scratch_dir: settings.scratch_dir(),
            variant: if settings.log_config {
                ConfigVariant::WithLogging
            } else {
                ConfigVariant::Minimal
            },
            shutdown_grace: settings.shutdown_grace(),
            stop_timeout: settings.stop_timeout(),
        }
    }
}

/// How the exit watcher should end a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Kill,
    /// Interrupt, wait up to the grace period, then kill
    Graceful(Duration),
}

struct RunningWorker {
    generation: u64,
    pid: u32,
    profile_name: String,
    config_path: PathBuf,
    started_at: DateTime<Utc>,
    stop_tx: oneshot::Sender<StopMode>,
    exited: watch::Receiver<bool>,
}

enum WorkerSlot {
    /// Reserved by an in-flight start
    Starting,
    Running(RunningWorker),
}

type Slots = Arc<Mutex<HashMap<i64, WorkerSlot>>>;

/// Snapshot of a running worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub profile_id: i64,
    pub profile_name: String,
    pub pid: u32,
    pub config_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Releases a `Starting` slot unless the start completed
struct Reservation<'a> {
    slots: &'a Mutex<HashMap<i64, WorkerSlot>>,
    profile_id: i64,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, worker: RunningWorker) {
        self.slots
            .lock()
            .insert(self.profile_id, WorkerSlot::Running(worker));
        self.armed = false;
    }
}

/// Keeps a stopped profile stopped while it is edited
pub struct StoppedProfile<'a> {
    _reservation: Reservation<'a>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.slots.lock();
        if matches!(slots.get(&self.profile_id), Some(WorkerSlot::Starting)) {
            slots.remove(&self.profile_id);
        }
    }
}

/// Starts, stops and tracks worker processes
pub struct Supervisor {
    slots: Slots,
    next_generation: AtomicU64,
    store: Arc<dyn Store>,
    resolver: Arc<dyn ExecutableResolver>,
    logs: Arc<LogAggregator>,
    timeline: Arc<TimelineEventLog>,
    builder: WorkerConfigBuilder,
    options: SupervisorOptions,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<dyn ExecutableResolver>,
        logs: Arc<LogAggregator>,
        timeline: Arc<TimelineEventLog>,
        options: SupervisorOptions,
    ) -> Self {
        let builder = WorkerConfigBuilder::new(&options.scratch_dir, options.variant);
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            store,
            resolver,
            logs,
            timeline,
            builder,
            options,
        }
    }

    /// Start a worker for the profile and return once it has been spawned
    pub async fn start(&self, profile_id: i64) -> Result<WorkerInfo, SupervisorError> {
        let started = Instant::now();
        let result = self.launch(profile_id, started);

        if let Err(e) = &result {
            let status = match e {
                SupervisorError::AlreadyRunning(_) => EventStatus::Warning,
                _ => EventStatus::Error,
            };
            self.timeline.append(
                EventType::Error,
                "Profile Start Failed",
                format!("Profile {} could not be started: {}", profile_id, e),
                status,
                ACTOR,
                format_duration(started.elapsed()),
                None,
            );
        }
        result
    }

    /// Hold the slot of a profile that has no worker, so no start can begin
    /// until the returned guard is dropped. `None` if a worker is starting or
    /// running.
    pub fn hold_stopped(&self, profile_id: i64) -> Option<StoppedProfile<'_>> {
        self.reserve(profile_id)
            .map(|reservation| StoppedProfile { _reservation: reservation })
    }

    /// Insert a `Starting` slot unless one already exists
    fn reserve(&self, profile_id: i64) -> Option<Reservation<'_>> {
        let mut slots = self.slots.lock();
        if slots.contains_key(&profile_id) {
            return None;
        }
        slots.insert(profile_id, WorkerSlot::Starting);
        Some(Reservation {
            slots: &self.slots,
            profile_id,
            armed: true,
        })
    }

    fn launch(&self, profile_id: i64, started: Instant) -> Result<WorkerInfo, SupervisorError> {
        let Some(exe) = self.resolver.resolve() else {
            self.log(
                LogLevel::Error,
                format!(
                    "Cannot start profile {}: worker executable '{}' is not available",
                    profile_id, self.options.command
                ),
                profile_id,
                None,
            );
            return Err(SupervisorError::WorkerUnavailable {
                command: self.options.command.clone(),
            });
        };

        let Some(reservation) = self.reserve(profile_id) else {
            self.log(
                LogLevel::Warn,
                format!("Profile {} is already running", profile_id),
                profile_id,
                None,
            );
            return Err(SupervisorError::AlreadyRunning(profile_id));
        };

        let profile = match self.store.profile(profile_id) {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                self.log(
                    LogLevel::Error,
                    format!("Failed to get profile {}: not found", profile_id),
                    profile_id,
                    None,
                );
                return Err(SupervisorError::ProfileNotFound(profile_id));
            }
            Err(e) => {
                let message = storage_message(&e);
                self.log(
                    LogLevel::Error,
                    format!("Failed to get profile {}: {}", profile_id, message),
                    profile_id,
                    None,
                );
                return Err(SupervisorError::Storage(message));
            }
        };
        let name = profile.name.clone();

        self.log(
            LogLevel::Info,
            format!("Starting profile: {} (ID: {})", name, profile_id),
            profile_id,
            Some(&name),
        );

        let scratch = match self.builder.write(&profile) {
            Ok(scratch) => scratch,
            Err(e) => {
                self.log(
                    LogLevel::Error,
                    format!("Failed to create config for profile {}: {}", name, e),
                    profile_id,
                    Some(&name),
                );
                return Err(SupervisorError::ConfigWriteFailure(e));
            }
        };
        self.log(
            LogLevel::Debug,
            format!("Config file created: {}", scratch.path().display()),
            profile_id,
            Some(&name),
        );

        let mut cmd = Command::new(&exe);
        cmd.arg("-C").arg(scratch.path());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Err(remove_err) = scratch.remove() {
                    warn!(profile_id, error = %remove_err, "Failed to remove scratch config");
                }
                self.log(
                    LogLevel::Error,
                    format!("Failed to start worker process for {}: {}", name, e),
                    profile_id,
                    Some(&name),
                );
                return Err(SupervisorError::SpawnFailure(e));
            }
        };

        let pid = child.id().unwrap_or(0);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        let info = WorkerInfo {
            profile_id,
            profile_name: name.clone(),
            pid,
            config_path: scratch.path().to_path_buf(),
            started_at: Utc::now(),
        };
        reservation.commit(RunningWorker {
            generation,
            pid,
            profile_name: name.clone(),
            config_path: info.config_path.clone(),
            started_at: info.started_at,
            stop_tx,
            exited: exited_rx,
        });

        self.timeline.append(
            EventType::ProxyAction,
            "Profile Started",
            format!("Proxy profile '{}' started on {}", name, profile.listen),
            EventStatus::Success,
            ACTOR,
            format_duration(started.elapsed()),
            Some(&name),
        );
        self.logs.record_for(
            LogLevel::Info,
            LogSource::Worker,
            format!("Worker process started for profile {} (PID: {})", name, pid),
            profile_id,
            &name,
        );

        if let Some(stdout) = stdout {
            tokio::spawn(drain_output(
                stdout,
                OutputStream::Stdout,
                Arc::clone(&self.logs),
                profile_id,
                name.clone(),
            ));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(drain_output(
                stderr,
                OutputStream::Stderr,
                Arc::clone(&self.logs),
                profile_id,
                name.clone(),
            ));
        }

        tokio::spawn(watch_exit(
            child,
            stop_rx,
            ExitWatch {
                slots: Arc::clone(&self.slots),
                logs: Arc::clone(&self.logs),
                timeline: Arc::clone(&self.timeline),
                profile_id,
                profile_name: name.clone(),
                generation,
                scratch,
                exited_tx,
            },
        ));

        self.record_activity(
            profile_id,
            &name,
            "started",
            &format!("Profile started: {}", name),
        );
        info!(profile_id, pid, "Worker started");
        Ok(info)
    }

    /// Force-kill the profile's worker and wait for it to be reaped
    pub async fn stop(&self, profile_id: i64) -> Result<(), SupervisorError> {
        let started = Instant::now();

        let slot = {
            let mut slots = self.slots.lock();
            if matches!(slots.get(&profile_id), Some(WorkerSlot::Running(_))) {
                slots.remove(&profile_id)
            } else {
                None
            }
        };
        let Some(WorkerSlot::Running(worker)) = slot else {
            self.log(
                LogLevel::Warn,
                format!("Profile {} is not running", profile_id),
                profile_id,
                None,
            );
            return Err(SupervisorError::NotRunning(profile_id));
        };

        let name = worker.profile_name.clone();
        terminate_worker(
            profile_id,
            worker,
            StopMode::Kill,
            self.options.stop_timeout,
            &self.logs,
        )
        .await;

        self.log(
            LogLevel::Info,
            format!("Profile {} stopped successfully", profile_id),
            profile_id,
            Some(&name),
        );
        self.timeline.append(
            EventType::ProxyAction,
            "Profile Stopped",
            format!("Proxy profile '{}' stopped", name),
            EventStatus::Success,
            ACTOR,
            format_duration(started.elapsed()),
            Some(&name),
        );
        self.record_activity(profile_id, &name, "stopped", &format!("Profile stopped: {}", name));
        Ok(())
    }

    /// Interrupt every worker, kill stragglers after the grace period, then
    /// close storage
    pub async fn close_all(&self) {
        let workers: Vec<(i64, RunningWorker)> = {
            let mut slots = self.slots.lock();
            slots
                .drain()
                .filter_map(|(id, slot)| match slot {
                    WorkerSlot::Running(worker) => Some((id, worker)),
                    WorkerSlot::Starting => None,
                })
                .collect()
        };

        if !workers.is_empty() {
            info!(count = workers.len(), "Stopping all workers");
        }

        let grace = self.options.shutdown_grace;
        let bound = grace + self.options.stop_timeout;
        let shutdowns = workers.into_iter().map(|(id, worker)| {
            let logs = Arc::clone(&self.logs);
            async move {
                terminate_worker(id, worker, StopMode::Graceful(grace), bound, &logs).await;
            }
        });
        futures::future::join_all(shutdowns).await;

        if let Err(e) = self.store.close() {
            self.logs.record(
                LogLevel::Error,
                LogSource::System,
                format!("Failed to close storage: {}", storage_message(&e)),
            );
        }
    }

    pub fn status(&self, profile_id: i64) -> ProfileStatus {
        match self.slots.lock().get(&profile_id) {
            Some(WorkerSlot::Running(_)) => ProfileStatus::Running,
            _ => ProfileStatus::Stopped,
        }
    }

    pub fn is_running(&self, profile_id: i64) -> bool {
        self.status(profile_id) == ProfileStatus::Running
    }

    pub fn running_profiles(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, WorkerSlot::Running(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self
            .slots
            .lock()
            .iter()
            .filter_map(|(id, slot)| match slot {
                WorkerSlot::Running(w) => Some(WorkerInfo {
                    profile_id: *id,
                    profile_name: w.profile_name.clone(),
                    pid: w.pid,
                    config_path: w.config_path.clone(),
                    started_at: w.started_at,
                }),
                WorkerSlot::Starting => None,
            })
            .collect();
        workers.sort_by_key(|w| w.profile_id);
        workers
    }

    fn log(&self, level: LogLevel, message: String, profile_id: i64, profile_name: Option<&str>) {
        self.logs
            .append(level, LogSource::Api, message, Some(profile_id), profile_name);
    }

    fn record_activity(&self, profile_id: i64, name: &str, action: &str, details: &str) {
        if let Err(e) = self
            .store
            .log_activity(profile_id, name, action, details, "success")
        {
            self.log(
                LogLevel::Warn,
                format!("Failed to record activity for {}: {}", name, storage_message(&e)),
                profile_id,
                Some(name),
            );
        }
    }
}

/// Hand the stop request to the exit watcher and wait, bounded, for the reap
async fn terminate_worker(
    profile_id: i64,
    worker: RunningWorker,
    mode: StopMode,
    bound: Duration,
    logs: &LogAggregator,
) {
    let RunningWorker {
        stop_tx,
        mut exited,
        profile_name,
        ..
    } = worker;

    // A closed channel means the watcher already saw the exit
    let _ = stop_tx.send(mode);

    let reaped = tokio::time::timeout(bound, exited.wait_for(|done| *done))
        .await
        .is_ok();
    if !reaped {
        let err = SupervisorError::ShutdownTimeout {
            profile_id,
            timeout: bound,
        };
        logs.append(
            LogLevel::Warn,
            LogSource::Api,
            err.to_string(),
            Some(profile_id),
            Some(&profile_name),
        );
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Forward each output line into the aggregator until EOF
async fn drain_output<R>(
    reader: R,
    stream: OutputStream,
    logs: Arc<LogAggregator>,
    profile_id: i64,
    profile_name: String,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                let level = match stream {
                    OutputStream::Stdout => LogLevel::Info,
                    OutputStream::Stderr => detect_log_level(line),
                };
                logs.record_for(level, LogSource::Worker, line, profile_id, &profile_name);
            }
            Ok(None) => break,
            Err(e) => {
                logs.record_for(
                    LogLevel::Warn,
                    LogSource::Worker,
                    format!("Error reading worker {}: {}", stream.as_str(), e),
                    profile_id,
                    &profile_name,
                );
                break;
            }
        }
    }
    debug!(profile_id, stream = stream.as_str(), "Worker output closed");
}

struct ExitWatch {
    slots: Slots,
    logs: Arc<LogAggregator>,
    timeline: Arc<TimelineEventLog>,
    profile_id: i64,
    profile_name: String,
    generation: u64,
    scratch: ScratchConfig,
    exited_tx: watch::Sender<bool>,
}

/// Owns the child until it exits, on its own or on request
async fn watch_exit(mut child: Child, stop_rx: oneshot::Receiver<StopMode>, ctx: ExitWatch) {
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        mode = stop_rx => {
            // A dropped sender counts as a kill request
            let mode = mode.unwrap_or(StopMode::Kill);
            (end_process(&mut child, mode, ctx.profile_id).await, true)
        }
    };

    if let Err(e) = ctx.scratch.remove() {
        warn!(profile_id = ctx.profile_id, error = %e, "Failed to remove scratch config");
    }

    {
        let mut slots = ctx.slots.lock();
        let ours = matches!(
            slots.get(&ctx.profile_id),
            Some(WorkerSlot::Running(w)) if w.generation == ctx.generation
        );
        if ours {
            slots.remove(&ctx.profile_id);
        }
    }

    let message = match &status {
        Ok(status) => format!(
            "Worker process exited for profile {} ({})",
            ctx.profile_name, status
        ),
        Err(e) => format!(
            "Worker process for profile {} could not be reaped: {}",
            ctx.profile_name, e
        ),
    };
    if !requested {
        let event_status = match &status {
            Ok(status) if status.success() => EventStatus::Warning,
            _ => EventStatus::Error,
        };
        ctx.timeline.append(
            EventType::Error,
            "Worker Exited",
            message.clone(),
            event_status,
            "system",
            "",
            Some(&ctx.profile_name),
        );
    }
    ctx.logs
        .record_for(LogLevel::Info, LogSource::Worker, message, ctx.profile_id, &ctx.profile_name);

    let _ = ctx.exited_tx.send(true);
}

async fn end_process(
    child: &mut Child,
    mode: StopMode,
    profile_id: i64,
) -> std::io::Result<ExitStatus> {
    match mode {
        StopMode::Kill => {
            child.kill().await?;
            child.wait().await
        }
        StopMode::Graceful(grace) => {
            if let Some(pid) = child.id() {
                debug!(profile_id, pid, "Sending SIGINT to worker");

                #[cfg(unix)]
                unsafe {
                    libc::kill(pid as i32, libc::SIGINT);
                }

                #[cfg(not(unix))]
                {
                    let _ = child.start_kill();
                }
            }

            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(
                        profile_id,
                        grace_period_ms = grace.as_millis() as u64,
                        "Grace period exceeded, killing worker"
                    );
                    child.kill().await?;
                    child.wait().await
                }
            }
        }
    }
}
