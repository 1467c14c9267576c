mod agent;
mod config;
mod core;
mod features;
#[cfg(test)]
mod testutil;
mod watcher;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::agent::Agent;
use crate::config::Config;
use crate::core::napi::NapiClient;
use crate::core::sysinfo;
use crate::core::vmadm::VmadmCli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "debug".into());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper_util=warn")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    let napi = NapiClient::new(&config.napi_url)?;
    let vmadm = Arc::new(VmadmCli::new(&config.vmadm_path));

    let cn_uuid = match config.cn_uuid {
        Some(uuid) => uuid,
        None => sysinfo::load(&config.sysinfo_path).await?.uuid,
    };
    info!(cn_uuid = %cn_uuid, agent_uuid = %config.agent_uuid, "starting network agent");

    let agent = Agent::new(config.clone(), cn_uuid, napi, vmadm);

    let app = features::router(agent.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    info!(bind = %config.bind, "status endpoint listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            error!(error = %err, "status endpoint failed");
        }
    });

    let stopper = agent.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            stopper.request_stop();
        }
    });

    agent.run().await
}
