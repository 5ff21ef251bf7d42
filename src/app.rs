//! Application facade
//!
//! [`Gostly`] wires storage, the log buffers, the supervisor and the router
//! together and is the single entry point for the control API and library
//! callers. [`GostlyHandle`] builds it lazily, once.

use crate::config::Config;
use crate::db::{ActivityLog, Database, HostMapping, Profile, ProfileStatus, Store};
use crate::error::{storage_message, AppError};
use crate::logs::{LogAggregator, LogEntry, LogLevel, LogSource};
use crate::resolver::{ExecutableResolver, SearchPathResolver, WorkerDiagnostics};
use crate::router::{HostRouter, RouterOptions, RouterStatus};
use crate::supervisor::{Supervisor, SupervisorOptions, WorkerInfo};
use crate::timeline::{EventStatus, EventType, TimelineEvent, TimelineEventLog};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

const ACTOR: &str = "admin";

pub struct Gostly {
    store: Arc<dyn Store>,
    logs: Arc<LogAggregator>,
    timeline: Arc<TimelineEventLog>,
    supervisor: Supervisor,
    router: HostRouter,
    resolver: Arc<dyn ExecutableResolver>,
}

impl Gostly {
    /// Build with the `PATH`-searching resolver from `[worker]`
    pub fn new(config: &Config, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let resolver = SearchPathResolver::new(config.worker.command.clone())
            .with_extra_paths(config.worker.extra_search_paths.clone())
            .with_version_flag(config.worker.version_flag.clone());
        Self::with_resolver(config, store, Arc::new(resolver))
    }

    pub fn with_resolver(
        config: &Config,
        store: Arc<dyn Store>,
        resolver: Arc<dyn ExecutableResolver>,
    ) -> anyhow::Result<Self> {
        let started = Instant::now();
        let logs = Arc::new(LogAggregator::new(config.logs.capacity));
        let timeline = Arc::new(TimelineEventLog::with_capacity(config.logs.timeline_capacity));

        let supervisor = Supervisor::new(
            Arc::clone(&store),
            Arc::clone(&resolver),
            Arc::clone(&logs),
            Arc::clone(&timeline),
            SupervisorOptions::from_settings(&config.worker),
        );
        let router = HostRouter::new(
            Arc::clone(&store),
            Arc::clone(&logs),
            Arc::clone(&timeline),
            RouterOptions::from_settings(&config.router),
        )?;

        let app = Self {
            store,
            logs,
            timeline,
            supervisor,
            router,
            resolver,
        };
        app.announce(started);
        Ok(app)
    }

    fn announce(&self, started: Instant) {
        self.logs.record(
            LogLevel::Info,
            LogSource::System,
            "Gostly core initialized successfully",
        );
        self.timeline.append(
            EventType::System,
            "Core Initialized",
            "Gostly core initialized successfully",
            EventStatus::Success,
            "system",
            crate::timeline::format_duration(started.elapsed()),
            None,
        );

        match self.resolver.resolve() {
            Some(path) => {
                let version = self
                    .resolver
                    .version()
                    .unwrap_or_else(|| "unknown version".to_string());
                self.logs.record(
                    LogLevel::Info,
                    LogSource::System,
                    format!("Worker detected: {} ({})", version, path.display()),
                );
                self.timeline.append(
                    EventType::System,
                    "Worker Detected",
                    format!("Worker binary detected: {}", version),
                    EventStatus::Success,
                    "system",
                    crate::timeline::format_duration(started.elapsed()),
                    None,
                );
            }
            None => {
                self.logs.record(
                    LogLevel::Info,
                    LogSource::System,
                    "Worker executable not found - manual installation required",
                );
            }
        }
    }

    // Profiles

    pub fn profiles(&self) -> Result<Vec<Profile>, AppError> {
        let mut profiles = self
            .store
            .profiles()
            .map_err(|e| self.storage_error("Failed to list profiles", e))?;
        for profile in &mut profiles {
            profile.status = self.supervisor.status(profile.id);
        }
        Ok(profiles)
    }

    pub fn profile(&self, id: i64) -> Result<Profile, AppError> {
        let mut profile = self.load_profile(id)?;
        profile.status = self.supervisor.status(id);
        Ok(profile)
    }

    pub fn add_profile(&self, mut profile: Profile) -> Result<Profile, AppError> {
        validate_profile(&profile)
            .map_err(|e| self.rejected(LogLevel::Warn, "Failed to add profile", e))?;

        let id = self.store.create_profile(&profile).map_err(|e| {
            self.storage_error(&format!("Failed to add profile {}", profile.name), e)
        })?;
        profile.id = id;
        profile.status = self.supervisor.status(id);

        self.logs.record_for(
            LogLevel::Info,
            LogSource::Api,
            format!("Profile created successfully: {} (ID: {})", profile.name, id),
            id,
            &profile.name,
        );
        self.timeline.append(
            EventType::Configuration,
            "Profile Created",
            format!(
                "New proxy profile '{}' created ({} on {})",
                profile.name, profile.profile_type, profile.listen
            ),
            EventStatus::Success,
            ACTOR,
            "",
            Some(&profile.name),
        );
        self.record_activity(
            id,
            &profile.name,
            "created",
            &format!(
                "Profile created with type: {}, listen: {}, remote: {}",
                profile.profile_type, profile.listen, profile.remote
            ),
        );
        Ok(profile)
    }

    /// Replace a stopped profile's fields
    pub fn update_profile(&self, mut profile: Profile) -> Result<Profile, AppError> {
        validate_profile(&profile)
            .map_err(|e| self.rejected(LogLevel::Warn, "Failed to update profile", e))?;

        // Starts of this profile are refused until the update is stored
        let Some(_stopped) = self.supervisor.hold_stopped(profile.id) else {
            self.logs.record_for(
                LogLevel::Warn,
                LogSource::Api,
                format!(
                    "Cannot update running profile {} (ID: {})",
                    profile.name, profile.id
                ),
                profile.id,
                &profile.name,
            );
            return Err(AppError::ProfileRunning(profile.id));
        };

        let updated = self.store.update_profile(&profile).map_err(|e| {
            self.storage_error(&format!("Failed to update profile {}", profile.name), e)
        })?;
        if !updated {
            return Err(self.rejected(
                LogLevel::Error,
                "Failed to get profile for update",
                AppError::ProfileNotFound(profile.id),
            ));
        }
        profile.status = ProfileStatus::Stopped;

        self.logs.record_for(
            LogLevel::Info,
            LogSource::Api,
            format!(
                "Profile updated successfully: {} (ID: {})",
                profile.name, profile.id
            ),
            profile.id,
            &profile.name,
        );
        self.timeline.append(
            EventType::Configuration,
            "Profile Updated",
            format!("Proxy profile '{}' configuration updated", profile.name),
            EventStatus::Success,
            ACTOR,
            "",
            Some(&profile.name),
        );
        self.record_activity(
            profile.id,
            &profile.name,
            "updated",
            &format!(
                "Profile updated: type: {}, listen: {}, remote: {}",
                profile.profile_type, profile.listen, profile.remote
            ),
        );
        Ok(profile)
    }

    pub fn delete_profile(&self, id: i64) -> Result<(), AppError> {
        let profile = self.load_profile(id).map_err(|e| match e {
            AppError::ProfileNotFound(_) => {
                self.rejected(LogLevel::Error, "Failed to get profile for deletion", e)
            }
            // already logged by storage_error
            e => e,
        })?;

        let Some(_stopped) = self.supervisor.hold_stopped(id) else {
            self.logs.record_for(
                LogLevel::Warn,
                LogSource::Api,
                format!("Cannot delete running profile {} (ID: {})", profile.name, id),
                id,
                &profile.name,
            );
            return Err(AppError::ProfileRunning(id));
        };

        let deleted = self.store.delete_profile(id).map_err(|e| {
            self.storage_error(&format!("Failed to delete profile {}", profile.name), e)
        })?;
        if !deleted {
            return Err(self.rejected(
                LogLevel::Error,
                "Failed to delete profile",
                AppError::ProfileNotFound(id),
            ));
        }

        self.logs.record_for(
            LogLevel::Info,
            LogSource::Api,
            format!("Profile deleted successfully: {} (ID: {})", profile.name, id),
            id,
            &profile.name,
        );
        self.timeline.append(
            EventType::Configuration,
            "Profile Deleted",
            format!("Proxy profile '{}' deleted", profile.name),
            EventStatus::Success,
            ACTOR,
            "",
            Some(&profile.name),
        );
        self.record_activity(
            id,
            &profile.name,
            "deleted",
            &format!("Profile deleted: {}", profile.name),
        );
        Ok(())
    }

    pub async fn start_profile(&self, id: i64) -> Result<WorkerInfo, AppError> {
        Ok(self.supervisor.start(id).await?)
    }

    pub async fn stop_profile(&self, id: i64) -> Result<(), AppError> {
        Ok(self.supervisor.stop(id).await?)
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.supervisor.workers()
    }

    // Host mappings

    pub fn host_mappings(&self) -> Result<Vec<HostMapping>, AppError> {
        self.store
            .host_mappings()
            .map_err(|e| self.storage_error("Failed to list host mappings", e))
    }

    /// Insert or replace the mapping for `mapping.hostname`.
    ///
    /// A running router keeps the routes it started with.
    pub fn upsert_host_mapping(&self, mut mapping: HostMapping) -> Result<HostMapping, AppError> {
        mapping.hostname = mapping.hostname.trim().to_string();
        validate_mapping(&mapping)
            .map_err(|e| self.rejected(LogLevel::Warn, "Failed to save host mapping", e))?;

        let exists = self
            .host_mappings()?
            .iter()
            .any(|m| m.hostname == mapping.hostname);
        mapping.id = self
            .store
            .upsert_host_mapping(&mapping)
            .map_err(|e| self.storage_error("Failed to save host mapping", e))?;

        let action = if exists {
            "Host Mapping Updated"
        } else {
            "Host Mapping Added"
        };
        self.timeline.append(
            EventType::HostMapping,
            action,
            format!(
                "Host mapping: {} -> {}:{} ({})",
                mapping.hostname,
                mapping.ip,
                mapping.port,
                mapping.protocol.as_str()
            ),
            EventStatus::Success,
            ACTOR,
            "",
            None,
        );
        self.logs.record(
            LogLevel::Info,
            LogSource::Api,
            format!("{}: {} -> {}", action, mapping.hostname, mapping.origin()),
        );
        Ok(mapping)
    }

    pub fn delete_host_mapping_by_hostname(&self, hostname: &str) -> Result<(), AppError> {
        let deleted = self
            .store
            .delete_host_mapping_by_hostname(hostname)
            .map_err(|e| self.storage_error("Failed to delete host mapping", e))?;
        if !deleted {
            return Err(self.rejected(
                LogLevel::Error,
                "Failed to delete host mapping",
                AppError::MappingNotFound(hostname.to_string()),
            ));
        }
        self.mapping_deleted(format!("Host mapping removed: {}", hostname));
        Ok(())
    }

    pub fn delete_host_mapping_by_id(&self, id: i64) -> Result<(), AppError> {
        let deleted = self
            .store
            .delete_host_mapping_by_id(id)
            .map_err(|e| self.storage_error("Failed to delete host mapping", e))?;
        if !deleted {
            return Err(self.rejected(
                LogLevel::Error,
                "Failed to delete host mapping",
                AppError::MappingNotFound(id.to_string()),
            ));
        }
        self.mapping_deleted(format!("Host mapping removed (ID: {})", id));
        Ok(())
    }

    fn mapping_deleted(&self, details: String) {
        self.logs.record(LogLevel::Info, LogSource::Api, details.clone());
        self.timeline.append(
            EventType::HostMapping,
            "Host Mapping Deleted",
            details,
            EventStatus::Success,
            ACTOR,
            "",
            None,
        );
    }

    // Router

    pub async fn start_router(&self, addr: &str) -> Result<(), AppError> {
        Ok(self.router.start(addr).await?)
    }

    pub async fn stop_router(&self) -> Result<(), AppError> {
        Ok(self.router.stop().await?)
    }

    pub fn router_status(&self) -> RouterStatus {
        self.router.status()
    }

    /// `(running, addr)`
    pub fn is_router_running(&self) -> (bool, String) {
        self.router.is_running()
    }

    // Logs, timeline and activity

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.all()
    }

    pub fn recent_logs(&self, n: usize) -> Vec<LogEntry> {
        self.logs.recent(n)
    }

    pub fn logs_by_level(&self, level: &str) -> Vec<LogEntry> {
        self.logs.by_level(level)
    }

    pub fn logs_by_source(&self, source: &str) -> Vec<LogEntry> {
        self.logs.by_source(source)
    }

    pub fn clear_logs(&self) {
        self.logs.clear();
    }

    pub fn timeline(&self) -> Vec<TimelineEvent> {
        self.timeline.all()
    }

    pub fn activity(&self) -> Result<Vec<ActivityLog>, AppError> {
        self.store
            .activity()
            .map_err(|e| self.storage_error("Failed to read activity", e))
    }

    pub fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityLog>, AppError> {
        self.store
            .recent_activity(limit)
            .map_err(|e| self.storage_error("Failed to read activity", e))
    }

    pub fn profile_activity(&self, profile_id: i64) -> Result<Vec<ActivityLog>, AppError> {
        self.store
            .profile_activity(profile_id)
            .map_err(|e| self.storage_error("Failed to read activity", e))
    }

    // Worker executable

    pub fn worker_available(&self) -> bool {
        self.resolver.resolve().is_some()
    }

    pub fn worker_version(&self) -> Option<String> {
        self.resolver.version()
    }

    pub fn worker_diagnostics(&self) -> WorkerDiagnostics {
        self.resolver.diagnostics()
    }

    /// Stop the router if it runs, then every worker, then close storage
    pub async fn close(&self) {
        if self.router.is_running().0 {
            if let Err(e) = self.router.stop().await {
                self.logs.record(
                    LogLevel::Warn,
                    LogSource::System,
                    format!("Failed to stop host router: {}", e),
                );
            }
        }
        self.supervisor.close_all().await;
        self.logs
            .record(LogLevel::Info, LogSource::System, "Gostly core shut down");
        info!("Gostly closed");
    }

    fn load_profile(&self, id: i64) -> Result<Profile, AppError> {
        match self.store.profile(id) {
            Ok(Some(profile)) => Ok(profile),
            Ok(None) => Err(AppError::ProfileNotFound(id)),
            Err(e) => Err(self.storage_error(&format!("Failed to get profile {}", id), e)),
        }
    }

    fn record_activity(&self, profile_id: i64, name: &str, action: &str, details: &str) {
        if let Err(e) = self
            .store
            .log_activity(profile_id, name, action, details, "success")
        {
            self.logs.record_for(
                LogLevel::Warn,
                LogSource::Api,
                format!("Failed to record activity: {}", storage_message(&e)),
                profile_id,
                name,
            );
        }
    }

    /// Log a refused mutation and hand the error back
    fn rejected(&self, level: LogLevel, context: &str, err: AppError) -> AppError {
        self.logs
            .record(level, LogSource::Api, format!("{}: {}", context, err));
        err
    }

    fn storage_error(&self, context: &str, err: anyhow::Error) -> AppError {
        let message = storage_message(&err);
        self.logs.record(
            LogLevel::Error,
            LogSource::Api,
            format!("{}: {}", context, message),
        );
        AppError::Storage(message)
    }
}

fn validate_profile(profile: &Profile) -> Result<(), AppError> {
    if profile.name.trim().is_empty() {
        return Err(AppError::Invalid("name is required".to_string()));
    }
    if profile.listen.trim().is_empty() {
        return Err(AppError::Invalid("listen address is required".to_string()));
    }
    Ok(())
}

fn validate_mapping(mapping: &HostMapping) -> Result<(), AppError> {
    if mapping.hostname.is_empty() {
        return Err(AppError::Invalid("hostname is required".to_string()));
    }
    if mapping.ip.trim().is_empty() {
        return Err(AppError::Invalid("ip is required".to_string()));
    }
    if mapping.port == 0 {
        return Err(AppError::Invalid("port must be greater than 0".to_string()));
    }
    Ok(())
}

/// Init-once holder for the process-wide [`Gostly`]
///
/// The first `get` opens storage and builds the facade; racing callers wait
/// for that one build. A failed build is not cached.
pub struct GostlyHandle {
    config: Config,
    cell: tokio::sync::OnceCell<Arc<Gostly>>,
}

impl GostlyHandle {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cell: tokio::sync::OnceCell::new(),
        }
    }

    pub async fn get(&self) -> anyhow::Result<Arc<Gostly>> {
        let gostly = self
            .cell
            .get_or_try_init(|| async {
                let db = Database::open(self.config.server.database_path())?;
                let gostly = Gostly::new(&self.config, Arc::new(db))?;
                Ok::<_, anyhow::Error>(Arc::new(gostly))
            })
            .await?;
        Ok(Arc::clone(gostly))
    }

    /// The facade, if some caller already built it
    pub fn initialized(&self) -> Option<Arc<Gostly>> {
        self.cell.get().cloned()
    }
}
