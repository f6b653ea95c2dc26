use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Error;
use async_trait::async_trait;

use super::error::QuayError;
use super::model::{
    AppPatch, Application, BuildAttempt, BuildStatus, ContainerState, LogKind, NewApp,
};

/// One unit of image-builder output, forwarded to the caller as it arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutput {
    /// A substantive output line (dependency install output, compiler
    /// errors, ...). Pure progress markers are filtered out upstream.
    Line(String),
    /// One line of the builder's own error report.
    Error(String),
}

#[async_trait]
pub trait ContainerRuntime {
    /// Whether an image tagged with the application name exists.
    async fn image_exists(&self, app_name: &str) -> Result<bool, Error>;

    /// Build the image from `context_dir` (which contains the synthesized
    /// Dockerfile), streaming output through `sink`. Returns an error when
    /// the builder reports a failure, after the error lines went to `sink`.
    async fn build_image(
        &self,
        context_dir: &Path,
        app_name: &str,
        sink: &(dyn Fn(BuildOutput) + Send + Sync),
    ) -> Result<(), Error>;

    async fn container_state(&self, app_name: &str) -> Result<ContainerState, Error>;

    /// Create a container named after the application, bound to `host_port`
    /// with the per-app log directory mounted, and start it.
    async fn create_and_start(&self, app: &Application, host_port: u16) -> Result<(), Error>;

    /// Restart an existing container in place, preserving its identity and
    /// exposed port.
    async fn restart(&self, app_name: &str) -> Result<(), Error>;

    /// Stop the container if one is running. No-op otherwise.
    async fn stop(&self, app_name: &str) -> Result<(), Error>;

    /// Tail the last `lines` lines of the application's redirected log file.
    async fn tail_logs(&self, app_name: &str, lines: usize) -> Result<Vec<String>, Error>;
}

/// Append-only per-application, per-attempt build/run log.
pub trait BuildLogs: Send + Sync {
    /// Atomically append a line to the attempt, creating it on first write.
    /// Concurrent appenders on the same application must never lose lines.
    fn append(
        &self,
        app_id: &str,
        build_id: &str,
        line: &str,
        status: BuildStatus,
        kind: LogKind,
    ) -> Result<(), QuayError>;

    /// Snapshot of every attempt recorded for the application.
    fn attempts(&self, app_id: &str) -> Result<BTreeMap<String, BuildAttempt>, QuayError>;

    fn get_attempt(&self, app_id: &str, build_id: &str)
        -> Result<Option<BuildAttempt>, QuayError>;

    /// The `n` most recent attempts, ordered by creation time descending.
    fn list_recent(&self, app_id: &str, n: usize) -> Result<Vec<BuildAttempt>, QuayError>;
}

/// Lookup fields supported by [`ApplicationRepository::get_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppField {
    Name,
    UserId,
}

/// Application metadata collaborator. The domain only ever sees this trait;
/// the backing store is an infrastructure concern.
pub trait ApplicationRepository: Send + Sync {
    /// Persist a new application, enforcing name uniqueness and assigning
    /// the next numeric id.
    fn register(&self, new: NewApp) -> Result<Application, QuayError>;

    fn get(&self, app_id: &str) -> Result<Option<Application>, QuayError>;

    /// First non-deleted application matching the field.
    fn get_by(&self, field: AppField, value: &str) -> Result<Option<Application>, QuayError>;

    fn update(&self, app_id: &str, patch: AppPatch) -> Result<Application, QuayError>;

    fn soft_delete(&self, app_id: &str) -> Result<(), QuayError>;
}

/// Reverse-proxy routing registrar.
#[async_trait]
pub trait RouteRegistrar: Send + Sync {
    /// Idempotently ensure a subdomain route for the application exists,
    /// pointing at `host_port` on the local host.
    async fn ensure_route(&self, app_name: &str, host_port: u16) -> Result<(), Error>;
}
