use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fleet_monitor::{
    agent::AgentInventory,
    bus::{LocalBus, PubSub},
    config::{MonitorConfig, read_config_file},
    pool::{MonitorPool, PoolSpec, job_fn},
    repartitioner::Repartitioner,
    resource::{Resource, ResourceType},
    runner::{HEALTH_CATEGORY, METRICS_CATEGORY, MonitorRunner},
    tsdb::TsdbClient,
    wrapper::{MetricsTargetResource, MonitorableResource},
};
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: Option<String>,

    /// Partition number of this process (overrides env and config file)
    #[arg(long)]
    partition: Option<u32>,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("fleet_monitor", LevelFilter::DEBUG),
        ("monitor", LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let mut config = match &args.file {
        Some(file) => read_config_file(file)?,
        None => MonitorConfig::default(),
    };
    config.apply_env();
    if let Some(partition) = args.partition {
        config.partition = partition;
    }

    let bus = connect_bus(&config).await?;
    let repartitioner = Arc::new(Repartitioner::new(config.repartitioner_config(), bus)?);
    let listener = tokio::spawn(listen(repartitioner.clone()));

    let inventory = Arc::new(AgentInventory::new(config.hosts.clone())?);
    let types: Vec<Arc<dyn ResourceType>> = vec![inventory];

    let tsdb = match &config.tsdb {
        Some(tsdb) => Some(Arc::new(TsdbClient::new(&tsdb.endpoint)?)),
        None => {
            warn!("no TSDB configured, metrics export is disabled");
            None
        }
    };

    let session_fresh_for = config.session_fresh_for();
    let health = MonitorPool::create(PoolSpec {
        category: HEALTH_CATEGORY.to_string(),
        factory: Arc::new(move |resource: Arc<dyn Resource>| {
            MonitorableResource::new(resource).with_session_freshness(session_fresh_for)
        }),
        stuck: config.stuck_pulse_info(),
        worker_hint: config.health_workers,
        reserved_tasks: config.reserved_tasks,
        types: types.clone(),
        attached_types: Vec::new(),
        job: job_fn(|wrapper: Arc<MonitorableResource>| async move {
            wrapper.check_pulse().await;
            Ok(())
        }),
    })
    .await?;

    let metrics = MonitorPool::create(PoolSpec {
        category: METRICS_CATEGORY.to_string(),
        factory: Arc::new(move |resource: Arc<dyn Resource>| {
            MetricsTargetResource::new(resource, tsdb.clone())
        }),
        stuck: config.stuck_export_info(),
        worker_hint: config.metrics_workers,
        reserved_tasks: config.reserved_tasks,
        types,
        attached_types: Vec::new(),
        job: job_fn(|wrapper: Arc<MetricsTargetResource>| async move {
            wrapper.export_metrics().await;
            Ok(())
        }),
    })
    .await?;

    let mut runner = MonitorRunner::new(
        health,
        metrics,
        repartitioner.clone(),
        config.runner_settings(),
    );

    let handle = runner.handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c, shutting down"),
            Err(e) => error!("failed to listen for ctrl-c: {e}"),
        }
        handle.shutdown();
    });

    info!(
        partition = config.partition,
        hosts = config.hosts.len(),
        "starting monitor"
    );
    runner.run_or_exit().await;
    runner.wait_cleanup(Some(Duration::from_secs(5))).await;

    repartitioner.shutdown();
    if let Err(e) = listener.await {
        error!("partition listener failed: {e}");
    }

    Ok(())
}

async fn connect_bus(config: &MonitorConfig) -> anyhow::Result<Arc<dyn PubSub>> {
    #[cfg(feature = "pg-bus")]
    if let Some(url) = &config.database_url {
        let bus = fleet_monitor::bus::PgBus::connect(url).await?;
        debug!("using postgres notification bus");
        return Ok(Arc::new(bus));
    }

    if config.database_url.is_some() {
        warn!("database_url is set but postgres support is not compiled in");
    }
    debug!("using in-process notification bus");
    Ok(Arc::new(LocalBus::new()))
}

/// Keep the partition listener running, resubscribing after bus failures
async fn listen(repartitioner: Arc<Repartitioner>) {
    while !repartitioner.is_shutting_down() {
        match repartitioner.listen().await {
            Ok(()) => break,
            Err(e) => {
                error!("partition listener failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
