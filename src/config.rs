use anyhow::{Context, Error};
use config::Config;

#[derive(Debug, Clone, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub docker_socket: String,
    pub listen_addr: String,
    /// Directory holding the durable build log / application store.
    pub data_dir: String,
    /// Root of the per-application bind-mounted log directories.
    pub logs_dir: String,
    /// Host ports are `base_port + numeric_id`.
    pub base_port: u16,
    pub domain: String,
    pub proxy_config: String,
    /// Reload the reverse proxy after registering a route.
    pub production: bool,
    /// Token injected into clone URLs of private repositories.
    pub git_token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            docker_socket: "/var/run/docker.sock".to_string(),
            listen_addr: "0.0.0.0:3000".to_string(),
            data_dir: "./quay-data".to_string(),
            logs_dir: "./quay-logs".to_string(),
            base_port: 20000,
            domain: "localhost".to_string(),
            proxy_config: "/etc/nginx/conf.d/quay.conf".to_string(),
            production: false,
            git_token: None,
        }
    }
}

pub fn load_config() -> Result<AppConfig, Error> {
    let config = Config::builder()
        .add_source(config::Environment::with_prefix("quay").try_parsing(true))
        .build()
        .context("Can't load configuration")?;

    config
        .try_deserialize()
        .context("Can't deserialize AppConfig from loaded configuration")
}
