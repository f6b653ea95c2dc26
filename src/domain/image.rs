//! Dockerfile synthesis from a validated manifest.

use std::path::Path;

use super::model::Manifest;

/// Directory inside the container that the lifecycle manager bind-mounts to
/// the per-application host log directory.
pub const CONTAINER_LOG_DIR: &str = "/var/log/quay";

/// Detect a dependency-installation file in the cloned source and return the
/// install command to prepend to the manifest's run steps.
pub fn detect_install_step(source_dir: &Path) -> Option<&'static str> {
    if source_dir.join("requirements.txt").is_file() {
        Some("pip install -r requirements.txt")
    } else if source_dir.join("package.json").is_file() {
        Some("npm install")
    } else {
        None
    }
}

/// Synthesize the Dockerfile for an application.
///
/// Run steps are joined with `&&` so a failure in any step aborts the image
/// build at that point. The start command redirects stdout and stderr to the
/// per-app log file so the lifecycle manager can tail it later.
pub fn synthesize(manifest: &Manifest, app_name: &str, install_step: Option<&str>) -> String {
    let mut dockerfile = String::new();
    dockerfile.push_str(&format!("FROM {}\n", manifest.base_image));
    dockerfile.push_str("WORKDIR /app\n");
    dockerfile.push_str("COPY . /app\n");

    for (key, value) in &manifest.env {
        dockerfile.push_str(&format!("ENV {key}=\"{value}\"\n"));
    }

    let run_steps: Vec<&str> = install_step
        .into_iter()
        .chain(manifest.run.iter().map(String::as_str))
        .collect();
    if !run_steps.is_empty() {
        dockerfile.push_str(&format!("RUN {}\n", run_steps.join(" && ")));
    }

    dockerfile.push_str(&format!("EXPOSE {}\n", manifest.port));

    let start = manifest.web.join(" && ");
    dockerfile.push_str(&format!(
        "CMD ({start}) >> {CONTAINER_LOG_DIR}/{app_name}.log 2>&1\n"
    ));
    dockerfile
}
