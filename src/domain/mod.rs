use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use git2::Repository;
use log::{error, info};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::AppConfig;

pub mod error;
pub mod image;
pub mod manifest;
pub mod model;
pub mod port;

use error::QuayError;
use model::{
    valid_name, AppState, Application, AttemptSummary, BuildStatus, ContainerState, LogKind,
    NewApp, Repo, StatusDocument, MAX_DESCRIPTION_LEN, UNKNOWN_BUILD_CODE,
};
use port::{ApplicationRepository, BuildLogs, BuildOutput, ContainerRuntime, RouteRegistrar};

/// How many attempts a status query returns as history.
const HISTORY_LIMIT: usize = 10;

pub struct DeployService {
    pub config: AppConfig,
    pub apps: Box<dyn ApplicationRepository + 'static>,
    pub logs: Box<dyn BuildLogs + 'static>,
    pub runtime: Box<dyn ContainerRuntime + 'static + Sync + Send>,
    pub registrar: Box<dyn RouteRegistrar + 'static>,
    /// Per-application guard serializing run/stop on the same application.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeployService {
    pub fn new(
        config: AppConfig,
        apps: Box<dyn ApplicationRepository>,
        logs: Box<dyn BuildLogs>,
        runtime: Box<dyn ContainerRuntime + Sync + Send>,
        registrar: Box<dyn RouteRegistrar>,
    ) -> Self {
        DeployService {
            config,
            apps,
            logs,
            runtime,
            registrar,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn app_lock(&self, app_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn log_attempt(
        &self,
        app: &Application,
        attempt_id: &str,
        line: &str,
        status: BuildStatus,
        kind: LogKind,
    ) -> Result<(), QuayError> {
        self.logs.append(&app.app_id, attempt_id, line, status, kind)
    }

    // ── Application registry ───────────────────────────────────────

    pub fn register_app(&self, new: NewApp) -> Result<Application, QuayError> {
        if !valid_name(&new.name) {
            return Err(QuayError::InvalidName(new.name));
        }
        if new.description.len() > MAX_DESCRIPTION_LEN {
            return Err(QuayError::DescriptionTooLong);
        }
        let name = new.name.to_lowercase();
        self.apps.register(NewApp { name, ..new })
    }

    // ── Build pipeline ─────────────────────────────────────────────

    /// Start a build in the background and hand back its id immediately.
    /// Progress is observable only through the build log store.
    pub fn start_build(self: &Arc<Self>, app: Application) -> String {
        let build_id = Uuid::new_v4().to_string();
        let service = Arc::clone(self);
        let id = build_id.clone();
        tokio::spawn(async move {
            service.run_build(app, id).await;
        });
        build_id
    }

    /// Run a build to completion. Never lets an error escape the task: any
    /// failure ends up as a terminal `failed` entry in the build log.
    async fn run_build(&self, app: Application, build_id: String) {
        info!("Starting build {build_id} for {}", app.name);
        if let Err(e) = self.try_build(&app, &build_id).await {
            error!("Build {build_id} for {} aborted: {e:#}", app.name);
            if let Err(log_err) = self.log_attempt(
                &app,
                &build_id,
                &format!("Build aborted: {e:#}"),
                BuildStatus::Failed,
                LogKind::Build,
            ) {
                error!("Could not record build failure for {}: {log_err}", app.name);
            }
        }
    }

    async fn try_build(&self, app: &Application, build_id: &str) -> Result<(), anyhow::Error> {
        let log = |line: &str, status: BuildStatus| {
            self.log_attempt(app, build_id, line, status, LogKind::Build)
        };

        // The tempdir is removed on drop, on every exit path.
        let workdir = tempfile::tempdir()?;

        log(&format!("Cloning {}", app.repo.git_url), BuildStatus::Building)?;
        let url = clone_url(&app.repo, self.config.git_token.as_deref());
        if let Err(e) = Repository::clone(&url, workdir.path()) {
            log(
                &format!("Failed to clone {}: {}", app.repo.git_url, e.message()),
                BuildStatus::Failed,
            )?;
            return Ok(());
        }

        let manifest_path = workdir.path().join(manifest::MANIFEST_FILE);
        if !manifest_path.is_file() {
            log(
                &format!("No {} found at the repository root", manifest::MANIFEST_FILE),
                BuildStatus::Failed,
            )?;
            return Ok(());
        }
        log(
            &format!("Validating {}", manifest::MANIFEST_FILE),
            BuildStatus::Building,
        )?;
        let manifest = match manifest::parse(&fs::read_to_string(&manifest_path)?) {
            Ok(manifest) => manifest,
            Err(e) => {
                log(&e.to_string(), BuildStatus::Failed)?;
                return Ok(());
            }
        };

        log("Synthesizing Dockerfile", BuildStatus::Building)?;
        let install_step = image::detect_install_step(workdir.path());
        let dockerfile = image::synthesize(&manifest, &app.name, install_step);
        fs::write(workdir.path().join("Dockerfile"), dockerfile)?;

        log(&format!("Building image {}", app.name), BuildStatus::Building)?;
        let result = self
            .runtime
            .build_image(workdir.path(), &app.name, &|output| {
                let (line, status) = match output {
                    BuildOutput::Line(line) => (line, BuildStatus::Building),
                    BuildOutput::Error(line) => (line, BuildStatus::Failed),
                };
                if let Err(e) = log(&line, status) {
                    error!("Could not record builder output for {}: {e}", app.name);
                }
            })
            .await;

        match result {
            Ok(()) => log("Build completed successfully", BuildStatus::Success)?,
            Err(e) => {
                error!("Image build for {} failed: {e:#}", app.name);
                log("Build failed", BuildStatus::Failed)?;
            }
        }
        Ok(())
    }

    // ── Container lifecycle ────────────────────────────────────────

    /// Start (or restart) the application's container in the background.
    /// Fails fast with [`QuayError::NotBuilt`] when no image exists, without
    /// touching the subdomain registrar.
    pub async fn start_run(self: &Arc<Self>, app: Application) -> Result<String, QuayError> {
        let run_id = Uuid::new_v4().to_string();
        let built = self
            .runtime
            .image_exists(&app.name)
            .await
            .map_err(|e| QuayError::Runtime(format!("{e:#}")))?;
        if !built {
            self.log_attempt(
                &app,
                &run_id,
                "App has not been built",
                BuildStatus::Failed,
                LogKind::Run,
            )?;
            return Err(QuayError::NotBuilt);
        }

        let service = Arc::clone(self);
        let id = run_id.clone();
        tokio::spawn(async move {
            service.run_app(app, id).await;
        });
        Ok(run_id)
    }

    async fn run_app(&self, app: Application, run_id: String) {
        let lock = self.app_lock(&app.app_id).await;
        let _guard = lock.lock().await;
        info!("Starting run {run_id} for {}", app.name);
        if let Err(e) = self.try_run(&app, &run_id).await {
            error!("Run {run_id} for {} failed: {e:#}", app.name);
            if let Err(log_err) = self.log_attempt(
                &app,
                &run_id,
                &format!("Run failed: {e:#}"),
                BuildStatus::Failed,
                LogKind::Run,
            ) {
                error!("Could not record run failure for {}: {log_err}", app.name);
            }
        }
    }

    async fn try_run(&self, app: &Application, run_id: &str) -> Result<(), anyhow::Error> {
        let log = |line: &str, status: BuildStatus| {
            self.log_attempt(app, run_id, line, status, LogKind::Run)
        };
        let host_port = app.host_port(self.config.base_port);

        // Routing must be in place before the container can receive traffic.
        log(
            &format!("Registering subdomain route for {}", app.name),
            BuildStatus::SettingUp,
        )?;
        self.registrar.ensure_route(&app.name, host_port).await?;

        match self.runtime.container_state(&app.name).await? {
            ContainerState::Absent => {
                log(
                    &format!("Creating container on port {host_port}"),
                    BuildStatus::SettingUp,
                )?;
                self.runtime.create_and_start(app, host_port).await?;
            }
            ContainerState::Stopped | ContainerState::Running => {
                log("Restarting existing container", BuildStatus::SettingUp)?;
                self.runtime.restart(&app.name).await?;
            }
        }

        log(
            &format!("{} is running on port {host_port}", app.name),
            BuildStatus::Success,
        )?;
        Ok(())
    }

    /// Stop the application's container. Stopping an absent or already
    /// stopped container is a no-op, not an error.
    pub async fn stop_app(&self, app: &Application) -> Result<(), QuayError> {
        let lock = self.app_lock(&app.app_id).await;
        let _guard = lock.lock().await;
        self.runtime
            .stop(&app.name)
            .await
            .map_err(|e| QuayError::Runtime(format!("{e:#}")))
    }

    // ── Status queries ─────────────────────────────────────────────

    pub async fn app_state(&self, app: &Application) -> Result<AppState, QuayError> {
        let map_err = |e: anyhow::Error| QuayError::Runtime(format!("{e:#}"));
        if !self.runtime.image_exists(&app.name).await.map_err(map_err)? {
            return Ok(AppState::NotBuilt);
        }
        match self
            .runtime
            .container_state(&app.name)
            .await
            .map_err(map_err)?
        {
            ContainerState::Running => Ok(AppState::Running),
            ContainerState::Absent | ContainerState::Stopped => Ok(AppState::NotRunning),
        }
    }

    pub async fn status_document(
        &self,
        app: &Application,
        include_logs: bool,
        include_history: bool,
    ) -> Result<StatusDocument, QuayError> {
        let state = self.app_state(app).await?;
        let recent = self.logs.list_recent(&app.app_id, HISTORY_LIMIT)?;
        let latest = recent
            .first()
            .map(|attempt| AttemptSummary::from_attempt(attempt, include_logs));
        let history = if include_history {
            recent
                .iter()
                .skip(1)
                .map(|attempt| AttemptSummary::from_attempt(attempt, include_logs))
                .collect()
        } else {
            Vec::new()
        };
        Ok(StatusDocument {
            name: app.name.clone(),
            state,
            latest,
            history,
        })
    }

    /// Tail the application's redirected log file.
    pub async fn app_logs(&self, app: &Application, n: usize) -> Result<Vec<String>, QuayError> {
        let map_err = |e: anyhow::Error| QuayError::Runtime(format!("{e:#}"));
        if self
            .runtime
            .container_state(&app.name)
            .await
            .map_err(map_err)?
            == ContainerState::Absent
        {
            return Err(QuayError::NotRunning);
        }
        self.runtime.tail_logs(&app.name, n).await.map_err(map_err)
    }

    /// Current numeric status code for a build, for the websocket channel.
    pub fn build_status_code(&self, app_id: &str, build_id: &str) -> u8 {
        match self.logs.get_attempt(app_id, build_id) {
            Ok(Some(attempt)) => attempt.status.code(),
            _ => UNKNOWN_BUILD_CODE,
        }
    }
}

/// Clone URL for a repository, carrying credentials only when the repository
/// is private and a token is configured.
fn clone_url(repo: &Repo, token: Option<&str>) -> String {
    if repo.private {
        if let Some(token) = token {
            if let Some(rest) = repo.git_url.strip_prefix("https://") {
                return format!("https://{token}@{rest}");
            }
        }
    }
    repo.git_url.clone()
}
