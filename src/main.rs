use anyhow::Result;
use helios::cache::FileSnapshotStore;
use helios::client::{GatewayHttp, Protocol, client_for};
use helios::config::ProtocolPreference;
use helios::config::migrate::migrate;
use helios::coordinator::query_timeout;
use helios::firmware::{detect_profile, detect_upgrade, fetch_supervisor_info};
use helios::logging::{get_logger, init_logging};
use helios::{Config, Coordinator};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?;
    let migrations = migrate(&mut config);
    config.validate()?;
    init_logging(&config.logging)?;

    let logger = get_logger("main");
    logger.info(&format!(
        "Helios {} starting for PVS at {}",
        env!("APP_VERSION"),
        config.gateway.host
    ));
    for m in &migrations {
        logger.info(&format!("Config migration applied: {m}"));
    }

    let http = GatewayHttp::new(&config.gateway.host, config.gateway.credential.clone())?;
    let setup_timeout = query_timeout(config.polling_interval());

    let client = match config.gateway.protocol {
        ProtocolPreference::Auto => {
            let detected = detect_profile(&http, config.gateway.credential.clone(), setup_timeout)
                .await
                .map_err(|e| anyhow::anyhow!("Gateway setup failed: {e}"))?;
            logger.info(&format!(
                "Detected {} protocol (build {})",
                detected.profile.protocol(),
                detected
                    .profile
                    .build_number
                    .map_or_else(|| "unknown".to_string(), |b| b.to_string())
            ));
            detected.client
        }
        ProtocolPreference::Legacy => {
            if config.gateway.firmware_build.is_some() {
                match fetch_supervisor_info(&http, setup_timeout).await {
                    Ok(info) => {
                        if let Some(up) = detect_upgrade(
                            Protocol::Legacy,
                            config.gateway.firmware_build.as_deref(),
                            info.build,
                        ) {
                            logger.warn(&format!(
                                "PVS firmware upgraded to build {} which supports the varserver protocol; set gateway.protocol to auto or varserver",
                                up.to
                            ));
                        }
                    }
                    Err(e) => logger.debug(&format!("Upgrade check skipped: {e}")),
                }
            }
            client_for(Protocol::Legacy, Arc::new(http))
        }
        ProtocolPreference::Varserver => client_for(Protocol::Varserver, Arc::new(http)),
    };

    let store = Arc::new(FileSnapshotStore::new(&config.cache.directory));
    let web = config.web.clone();
    let mut coordinator = Coordinator::new(config, client, store);

    #[cfg(feature = "web")]
    let web_task = web.enabled.then(|| {
        let status_rx = coordinator.subscribe();
        let web_logger = get_logger("web");
        tokio::spawn(async move {
            if let Err(e) = helios::web::serve(status_rx, &web.host, web.port).await {
                web_logger.error(&format!("Web server error: {e}"));
            }
        })
    });
    #[cfg(not(feature = "web"))]
    let _ = web;

    let shutdown = coordinator.shutdown_handle();
    let signal_logger = logger.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_logger.info("Interrupt received, stopping");
            shutdown.send(()).ok();
        }
    });

    let result = coordinator.run().await;

    #[cfg(feature = "web")]
    {
        if let Some(task) = web_task {
            task.abort();
        }
    }

    match result {
        Ok(()) => {
            logger.info("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            logger.error(&format!("Coordinator failed: {e}"));
            Err(anyhow::anyhow!("Coordinator error: {e}"))
        }
    }
}
