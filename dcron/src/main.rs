use std::sync::Arc;

use common_redis::{Client, CustomRedisError, RedisClient, RedisClusterClient};
use dcron::config::{Config, DriverKind};
use dcron::{Dcron, ExecJob, RedisJobStore};
use dcron_coordination::{Driver, EtcdDriver, RedisDriver, RedisZSetDriver};
use envconfig::Envconfig;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

async fn shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    // Exactly one of the two layers is Some
    let json_layer = json.then(|| fmt::layer().json().with_target(true));
    let text_layer = (!json).then(|| fmt::layer().with_target(true).with_level(true));

    tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(filter)
        .init();
}

async fn redis_client(config: &Config, kind: DriverKind) -> Result<Arc<dyn Client>, CustomRedisError> {
    if kind == DriverKind::RedisCluster {
        let client = RedisClusterClient::with_config(
            config.redis_cluster_node_list(),
            config.redis_response_timeout(),
            config.redis_connection_timeout(),
        )
        .await?;
        return Ok(Arc::new(client));
    }

    let client = RedisClient::with_config(
        config.redis_url.clone(),
        config.redis_response_timeout(),
        config.redis_connection_timeout(),
    )
    .await?;
    Ok(Arc::new(client))
}

async fn build_driver(
    config: &Config,
    kind: DriverKind,
) -> Result<Option<Box<dyn Driver>>, Box<dyn std::error::Error>> {
    let driver: Box<dyn Driver> = match kind {
        DriverKind::Local => return Ok(None),
        DriverKind::Redis | DriverKind::RedisCluster => {
            Box::new(RedisDriver::new(redis_client(config, kind).await?))
        }
        DriverKind::RedisZSet => Box::new(RedisZSetDriver::new(redis_client(config, kind).await?)),
        DriverKind::Etcd => Box::new(EtcdDriver::connect(&config.etcd_endpoint_list()).await?),
    };
    Ok(Some(driver))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::init_from_env().expect("Invalid configuration");
    init_tracing(config.json_logs());

    let kind = config.driver_kind()?;
    tracing::info!("Starting dcron for service {}", config.service_name);
    tracing::info!("Driver: {:?}", kind);
    tracing::info!("Node update interval: {}ms", config.node_update_interval_ms);

    let dcron_config = config.dcron_config()?;
    let mut dcron = match build_driver(&config, kind).await? {
        Some(driver) => Dcron::new(&config.service_name, driver, dcron_config),
        None => Dcron::running_locally(&config.service_name, dcron_config),
    };

    let mut jobs = match &config.jobs_file {
        Some(path) => ExecJob::load_file(path).await?,
        None => Vec::new(),
    };
    for job in &mut jobs {
        job.timeout_secs.get_or_insert(config.exec_timeout_secs);
    }

    if config.job_store_enabled {
        let store = Arc::new(RedisJobStore::new(
            redis_client(&config, kind).await?,
            &config.service_name,
        ));
        for job in &jobs {
            match store.store(job).await {
                Ok(()) => tracing::info!("Stored job {}", job.name),
                Err(dcron::Error::JobExists(name)) => tracing::info!("Job {} already stored", name),
                Err(e) => return Err(e.into()),
            }
        }
        dcron = dcron.with_recover_func(store.recover_func());
    } else {
        for job in jobs {
            job.register(&dcron)?;
        }
    }

    dcron.start().await?;
    tracing::info!("dcron node {} is up", dcron.node_id());

    shutdown_signal().await;
    dcron.stop().await?;
    Ok(())
}
