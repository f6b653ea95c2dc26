use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use bollard::{Docker, API_DEFAULT_VERSION};
use log::info;
use tokio::net::TcpListener;

mod config;
mod domain;
mod infra;

use config::load_config;
use domain::DeployService;
use infra::{
    docker::DockerContainerRuntime, logstore::Store, proxy::NginxRegistrar, web::router,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    info!("Starting quay - single host PaaS control plane");

    let config = load_config()?;
    info!("Loaded config {:?}", config);

    let docker = Docker::connect_with_socket(&config.docker_socket, 120, API_DEFAULT_VERSION)
        .context("Can't connect to docker socket")?;

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.logs_dir)?;
    let store = Store::open(&Path::new(&config.data_dir).join("quay.redb"))?;

    let registrar = NginxRegistrar {
        config_path: config.proxy_config.clone().into(),
        domain: config.domain.clone(),
        reload: config.production,
    };
    let runtime = DockerContainerRuntime {
        config: config.clone(),
        docker,
    };
    let service = Arc::new(DeployService::new(
        config.clone(),
        Box::new(store.clone()),
        Box::new(store),
        Box::new(runtime),
        Box::new(registrar),
    ));

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Listening on {}", config.listen_addr);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    // Dropping the service here closes the store; redb commits every write
    // transaction, so nothing buffered survives past this point.
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
