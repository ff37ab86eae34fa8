//! Standalone mode: every subsystem in one process.
//!
//! In this mode, the daemon:
//! 1. Loads the configuration and opens the state store
//! 2. Builds the market catalog and seeds the simulated cloud's prices
//! 3. Seeds a demo user (and optionally demo jobs)
//! 4. Starts the provisioner loops, the scheduler, and the local cluster
//! 5. Waits for Ctrl-C, then stops every loop through one shutdown signal

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use spotgrid_cloud::SimulatedCloud;
use spotgrid_core::{CloudAccount, SpotgridConfig, SystemClock};
use spotgrid_market::{MarketCache, MarketCatalog, MatchingEngine};
use spotgrid_provisioner::Provisioner;
use spotgrid_scheduler::Scheduler;
use spotgrid_state::{NewJob, ResourceShape, StateStore, User};
use tokio::sync::watch;
use tracing::info;

use crate::local_cluster::LocalCluster;

pub struct StandaloneOptions {
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub simulate_job_secs: u64,
    pub demo_jobs: u32,
}

/// Load the config file, or defaults when none is given.
fn load_config(path: Option<&Path>) -> anyhow::Result<SpotgridConfig> {
    match path {
        Some(path) => SpotgridConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(SpotgridConfig::default()),
    }
}

pub fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;
    if let Some(catalog) = &config.market.catalog_file {
        let catalog = MarketCatalog::from_file(catalog)?;
        info!(regions = catalog.regions().count(), "catalog file is valid");
    }
    print!("{}", config.to_toml_string()?);
    Ok(())
}

pub async fn run_standalone(opts: StandaloneOptions) -> anyhow::Result<()> {
    info!("spotgrid daemon starting in standalone mode");

    let mut config = load_config(opts.config.as_deref())?;
    if let Some(data_dir) = opts.data_dir {
        config.store.data_dir = data_dir;
    }

    // ── State store ────────────────────────────────────────────

    std::fs::create_dir_all(&config.store.data_dir)?;
    let db_path = config.store.data_dir.join("spotgrid.redb");
    let clock = SystemClock::shared();
    let store = StateStore::open(&db_path)?.with_clock(clock.clone());
    info!(path = ?db_path, "state store opened");

    // ── Markets ────────────────────────────────────────────────

    let catalog = Arc::new(match &config.market.catalog_file {
        Some(path) => MarketCatalog::from_file(path)?,
        None => MarketCatalog::builtin(),
    });
    let cloud = SimulatedCloud::new(clock.clone());
    seed_prices(&cloud, &catalog).await;
    let cache = MarketCache::new(&catalog, clock.clone(), config.market.unavailable_ttl);
    let engine = Arc::new(MatchingEngine::new(
        catalog.clone(),
        cache.clone(),
        Arc::new(cloud.clone()),
        store.clone(),
        &config.market,
    ));
    info!(
        regions = catalog.regions().count(),
        zones = catalog.zones().count(),
        "market catalog loaded"
    );

    seed_demo(&store, &catalog, opts.demo_jobs)?;

    // ── Components ─────────────────────────────────────────────

    let provisioner = Provisioner::new(
        store.clone(),
        Arc::new(cloud.clone()),
        Arc::new(cloud),
        cache,
        catalog,
        config.provisioner.clone(),
    );
    let cluster = LocalCluster::new(store.clone(), Duration::from_secs(opts.simulate_job_secs));
    let scheduler = Scheduler::new(
        store,
        engine,
        Arc::new(cluster.clone()),
        config.scheduler.clone(),
    );
    let events = scheduler.handle();

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = provisioner.run(shutdown_rx.clone());
    handles.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));
    handles.push(tokio::spawn(cluster.run(
        events,
        config.scheduler.framework_name.clone(),
        shutdown_rx,
    )));

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    info!("spotgrid daemon stopped");
    Ok(())
}

/// Give every spot-biddable market a stable price so matching has
/// something to choose from.
async fn seed_prices(cloud: &SimulatedCloud, catalog: &MarketCatalog) {
    for (zone_index, zone) in catalog.zones().enumerate() {
        for instance_type in catalog.instance_types() {
            if !catalog.is_supported(zone, instance_type) {
                continue;
            }
            let Some(spec) = catalog.instance(instance_type) else {
                continue;
            };
            let memory_gb = spec.memory_mb as f64 / 1024.0;
            let base = spec.cpu * 0.0125 + memory_gb * 0.0025 + spec.gpu as f64 * 0.2;
            let price = base * (1.0 + 0.05 * (zone_index % 4) as f64);
            cloud
                .set_price(zone, instance_type, &format!("{price:.4}"))
                .await;
        }
    }
}

/// Make sure a user exists, and submit `demo_jobs` small jobs for it.
fn seed_demo(store: &StateStore, catalog: &MarketCatalog, demo_jobs: u32) -> anyhow::Result<()> {
    let user = match store.list_users()?.into_iter().next() {
        Some(user) => user,
        None => {
            let user = store.put_user(&User {
                id: 0,
                name: "demo".to_string(),
                account: CloudAccount::wired_for(catalog.zones()),
            })?;
            info!(user_id = user.id, "demo user created");
            user
        }
    };
    for n in 0..demo_jobs {
        let job = store.create_job(NewJob {
            owner_id: user.id,
            name: format!("demo-{n}"),
            command: "sleep 30".to_string(),
            image: "busybox:latest".to_string(),
            shape: ResourceShape {
                cpu: 1.0,
                memory_mb: 512,
                gpu: 0,
                disk_gb: 0.0,
            },
        })?;
        info!(job_id = job.id, "demo job submitted");
    }
    Ok(())
}
