//! Reverse-proxy subdomain registrar.
//!
//! Routes live in a single nginx config file made of `server { ... }`
//! blocks. The registrar only ever appends whole blocks and never rewrites
//! existing ones; a reload is triggered only in production mode so dev and
//! test environments are not coupled to a running proxy process.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Error};
use async_trait::async_trait;
use log::{info, warn};
use tokio::process::Command;

use crate::domain::error::QuayError;
use crate::domain::model::valid_name;
use crate::domain::port::RouteRegistrar;

pub struct NginxRegistrar {
    pub config_path: PathBuf,
    pub domain: String,
    /// Reload nginx after appending a route. Off outside production.
    pub reload: bool,
}

/// Whether the config already routes a subdomain for `app_name`.
fn has_route(config: &str, app_name: &str) -> bool {
    let prefix = format!("{app_name}.");
    config
        .lines()
        .filter_map(|line| line.trim().strip_prefix("server_name "))
        .any(|names| {
            names
                .trim_end_matches(';')
                .split_whitespace()
                .any(|name| name.starts_with(&prefix))
        })
}

fn server_block(app_name: &str, domain: &str, host_port: u16) -> String {
    format!(
        "\nserver {{\n    listen 80;\n    server_name {app_name}.{domain};\n\n    location / {{\n        proxy_pass http://localhost:{host_port};\n        proxy_set_header Host $host;\n        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n    }}\n}}\n"
    )
}

#[async_trait]
impl RouteRegistrar for NginxRegistrar {
    async fn ensure_route(&self, app_name: &str, host_port: u16) -> Result<(), Error> {
        if !valid_name(app_name) {
            return Err(QuayError::InvalidName(app_name.to_string()).into());
        }

        // An unreadable config is treated as empty so first-time bootstrap
        // (no config file yet) can proceed; the append below will create it.
        let existing = match tokio::fs::read_to_string(&self.config_path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "Can't read proxy config {}: {e}. Assuming no existing routes",
                    self.config_path.display()
                );
                String::new()
            }
        };

        if has_route(&existing, app_name) {
            info!("Route for {app_name}.{} already registered", self.domain);
            return Ok(());
        }

        let updated = format!(
            "{existing}{}",
            server_block(app_name, &self.domain, host_port)
        );
        tokio::fs::write(&self.config_path, updated)
            .await
            .context(format!(
                "Error while writing proxy config {}",
                self.config_path.display()
            ))?;
        info!(
            "Registered route {app_name}.{} -> http://localhost:{host_port}",
            self.domain
        );

        if self.reload {
            let status = Command::new("nginx")
                .args(["-s", "reload"])
                .status()
                .await
                .context("Error while invoking nginx reload")?;
            if !status.success() {
                return Err(anyhow!("nginx reload exited with {status}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registrar(dir: &std::path::Path) -> NginxRegistrar {
        NginxRegistrar {
            config_path: dir.join("quay.conf"),
            domain: "quay.test".into(),
            reload: false,
        }
    }

    #[tokio::test]
    async fn ensure_route_appends_one_server_block() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = registrar(dir.path());

        registrar.ensure_route("demo", 20007).await.unwrap();

        let config = std::fs::read_to_string(&registrar.config_path).unwrap();
        assert!(config.contains("server_name demo.quay.test;"));
        assert!(config.contains("proxy_pass http://localhost:20007;"));
    }

    #[tokio::test]
    async fn ensure_route_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = registrar(dir.path());

        registrar.ensure_route("demo", 20007).await.unwrap();
        registrar.ensure_route("demo", 20007).await.unwrap();

        let config = std::fs::read_to_string(&registrar.config_path).unwrap();
        assert_eq!(config.matches("server_name demo.quay.test;").count(), 1);
    }

    #[tokio::test]
    async fn existing_routes_for_other_apps_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = registrar(dir.path());

        registrar.ensure_route("alpha", 20001).await.unwrap();
        registrar.ensure_route("beta", 20002).await.unwrap();

        let config = std::fs::read_to_string(&registrar.config_path).unwrap();
        assert!(config.contains("server_name alpha.quay.test;"));
        assert!(config.contains("server_name beta.quay.test;"));
    }

    #[tokio::test]
    async fn names_that_could_inject_directives_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = registrar(dir.path());

        for name in ["de mo", "demo;", "demo.other", "1demo", "x"] {
            assert!(registrar.ensure_route(name, 20007).await.is_err(), "{name}");
        }
        assert!(!registrar.config_path.exists());
    }

    #[tokio::test]
    async fn prefix_match_does_not_confuse_similar_names() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = registrar(dir.path());

        registrar.ensure_route("app", 20001).await.unwrap();
        registrar.ensure_route("app2", 20002).await.unwrap();

        let config = std::fs::read_to_string(&registrar.config_path).unwrap();
        assert!(config.contains("server_name app.quay.test;"));
        assert!(config.contains("server_name app2.quay.test;"));
    }

    #[test]
    fn unparsable_config_counts_as_no_route() {
        assert!(!has_route("%% not nginx at all {{{", "demo"));
        assert!(has_route(
            "server {\n  server_name demo.quay.test;\n}\n",
            "demo"
        ));
    }
}
