mod api;
mod cache;
mod collector;
mod config;
mod derivation;
mod error;
mod facts;
mod migrations;
mod model;
mod publisher;
mod reconciler;
mod scheduler;
mod state;
mod threshold;

use api::ApiClient;
use cache::SampleCache;
use clap::Parser;
use collector::IngestPipeline;
use config::AgentConfig;
use derivation::DerivationEngine;
use error::Result;
use model::MetricSample;
use publisher::{Publisher, PublisherConfig, SharedPublisher};
use reconciler::Reconciler;
use scheduler::Scheduler;
use state::StateStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use threshold::ThresholdEngine;
use tokio::sync::{mpsc, watch, Mutex};

#[derive(Parser, Debug)]
#[command(
    name = "bleemeo-agent-core",
    version,
    about = "Host-resident monitoring agent: collector ingestion, threshold evaluation, and remote reconciliation"
)]
struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bleemeo account id.
    #[arg(long)]
    account: Option<String>,

    /// Environment variable name that contains the agent registration key.
    #[arg(long, default_value = "BLEEMEO_AGENT_REGISTRATION_KEY")]
    registration_key_env: String,

    /// Remote API base URL.
    #[arg(long)]
    api_base: Option<String>,

    /// MQTT broker host.
    #[arg(long)]
    mqtt_host: Option<String>,

    /// MQTT broker port.
    #[arg(long)]
    mqtt_port: Option<u16>,

    /// Disable TLS on the MQTT session (defaults to enabled).
    #[arg(long)]
    mqtt_insecure: bool,

    /// Human-readable display name. Defaults to the host's own hostname.
    #[arg(long)]
    display_name: Option<String>,

    /// Address the Collector Listener binds to.
    #[arg(long, default_value = "127.0.0.1:2003")]
    listen_addr: std::net::SocketAddr,

    /// Where to persist agent state (registration ids, discovered entities, thresholds).
    #[arg(long, default_value = "state.json")]
    state_file: PathBuf,

    /// Reconciliation pass interval, in seconds.
    #[arg(long, default_value_t = 15)]
    reconcile_seconds: u64,

    /// Run a single reconciliation pass and exit.
    #[arg(long)]
    once: bool,

    /// Don't register or publish anything remotely; only log what would happen.
    #[arg(long)]
    dry_run: bool,
}

/// Promotes the Publisher from "not yet connected" to "connected" once the
/// agent has a registered identity, matching the original connector's
/// behavior of deferring the MQTT session to after HTTP registration.
async fn try_start_publisher(config: &AgentConfig, state: &Arc<StateStore>, shared_publisher: &SharedPublisher) {
    if shared_publisher.lock().await.is_some() {
        return;
    }
    let (Some(agent_uuid), Some(password)) = (
        state.get_typed::<String>("agent_uuid"),
        state.get_typed::<String>("password"),
    ) else {
        return;
    };

    let publisher_config = PublisherConfig {
        mqtt_host: config.mqtt_host.clone(),
        mqtt_port: config.mqtt_port,
        use_tls: config.mqtt_ssl,
        agent_uuid,
        password,
    };
    let (publisher, mut notifications) = Publisher::connect(publisher_config, state.clone());
    tracing::info!("publisher session established");

    // Remote-initiated notifications (config reload hints etc.) are out of
    // scope; drain the channel so the sender never blocks.
    tokio::spawn(async move { while notifications.recv().await.is_some() {} });

    *shared_publisher.lock().await = Some(publisher);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let registration_key = std::env::var(&args.registration_key_env).ok();

    let config = AgentConfig::load(
        args.config.as_deref(),
        args.account,
        registration_key,
        args.api_base,
        args.mqtt_host,
        args.mqtt_port,
        if args.mqtt_insecure { Some(false) } else { None },
        args.display_name,
        args.listen_addr,
        args.state_file,
        args.reconcile_seconds,
        args.once,
        args.dry_run,
    )?;

    tracing::info!(
        account = %config.account,
        api_base = %config.api_base,
        listen_addr = %config.collector_listen_addr,
        once = config.once,
        dry_run = config.dry_run,
        "agent starting"
    );

    let state = Arc::new(StateStore::load(&config.state_file)?);
    migrations::apply(&state);

    let mut thresholds = ThresholdEngine::builtin_defaults();
    thresholds.extend(config.thresholds.clone());
    let threshold_engine = Arc::new(ThresholdEngine::new(thresholds));

    let cache = Arc::new(SampleCache::new());
    let derivation = Arc::new(DerivationEngine::new(
        config.df_path_ignore.clone(),
        config.df_host_mount_point.clone(),
        &config.disk_monitor,
        config.network_interface_blacklist.clone(),
    ));

    let pipeline = IngestPipeline {
        derivation,
        threshold: threshold_engine.clone(),
        cache: cache.clone(),
        last_line_seen: Arc::new(std::sync::atomic::AtomicU64::new(cache::now_secs().to_bits())),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sample_tx, mut sample_rx) = mpsc::channel::<Vec<MetricSample>>(1024);
    let shared_publisher: SharedPublisher = Arc::new(Mutex::new(None));

    {
        let shared_publisher = shared_publisher.clone();
        tokio::spawn(async move {
            while let Some(batch) = sample_rx.recv().await {
                let guard = shared_publisher.lock().await;
                if let Some(publisher) = guard.as_ref() {
                    for sample in batch {
                        publisher.enqueue_sample(sample);
                    }
                }
                // no publisher session yet: samples are dropped, same as any
                // other drop-on-backpressure path in the intake pipeline
            }
        });
    }

    let listener_handle = tokio::spawn(collector::run_listener(
        config.collector_listen_addr,
        pipeline.clone(),
        shutdown_rx.clone(),
        sample_tx,
    ));

    let api = ApiClient::new(config.api_base.clone(), config.account.clone(), config.registration_key.clone())?;
    if let (Some(agent_uuid), Some(password)) = (
        state.get_typed::<String>("agent_uuid"),
        state.get_typed::<String>("password"),
    ) {
        api.set_agent_credentials(agent_uuid, password);
    }

    let reconciler = Arc::new(Reconciler::new(
        api,
        state.clone(),
        threshold_engine.clone(),
        cache.clone(),
        config.account.clone(),
        config.display_name.clone(),
        config.tags.clone(),
    ));

    if config.once {
        if config.dry_run {
            tracing::info!("--dry-run: would run a single reconciliation pass, exiting without contacting the remote API");
            return Ok(());
        }

        let mut system = sysinfo::System::new_all();
        system.refresh_all();
        let facts = facts::collect(&system);
        let fqdn = facts::fqdn(&facts).map(str::to_string);

        reconciler.run_pass(fqdn.as_deref(), &[], &[], &facts).await;
        try_start_publisher(&config, &state, &shared_publisher).await;

        tracing::info!("single reconciliation pass complete, exiting (--once)");
        let _ = shutdown_tx.send(true);
        let _ = listener_handle.await;
        return Ok(());
    }

    let scheduler = Scheduler::new();

    let reconcile_job_id = {
        let reconciler = reconciler.clone();
        let config = config.clone();
        let state = state.clone();
        let shared_publisher = shared_publisher.clone();
        scheduler.schedule(
            Arc::new(move || {
                let reconciler = reconciler.clone();
                let config = config.clone();
                let state = state.clone();
                let shared_publisher = shared_publisher.clone();
                Box::pin(async move {
                    if config.dry_run {
                        tracing::info!("--dry-run: skipping reconciliation pass");
                        return;
                    }
                    let mut system = sysinfo::System::new_all();
                    system.refresh_all();
                    let facts = facts::collect(&system);
                    let fqdn = facts::fqdn(&facts).map(str::to_string);
                    reconciler.run_pass(fqdn.as_deref(), &[], &[], &facts).await;
                    try_start_publisher(&config, &state, &shared_publisher).await;
                })
            }),
            config.reconcile_interval,
            Duration::from_secs(4),
        )
    };

    {
        let cache = cache.clone();
        scheduler.schedule(
            Arc::new(move || {
                let cache = cache.clone();
                Box::pin(async move {
                    cache.purge(cache::now_secs(), &[]);
                })
            }),
            config.cache_purge_interval,
            config.cache_purge_interval,
        );
    }

    {
        let shared_publisher = shared_publisher.clone();
        let pipeline = pipeline.clone();
        let state = state.clone();
        scheduler.schedule(
            Arc::new(move || {
                let shared_publisher = shared_publisher.clone();
                let pipeline = pipeline.clone();
                let state = state.clone();
                Box::pin(async move {
                    let idle_secs = pipeline.seconds_since_last_line();
                    if idle_secs > 60.0 {
                        tracing::warn!(idle_secs, "no collector data received recently");
                    }
                    if state.get_typed::<String>("agent_uuid").is_none() {
                        tracing::warn!("agent is not yet registered with the remote API");
                    }
                    match shared_publisher.lock().await.as_ref() {
                        Some(publisher) => {
                            if !publisher.is_connected() {
                                tracing::warn!("publisher session is currently disconnected");
                            }
                            let depth = publisher.queue_depth();
                            if depth > publisher::MAX_QUEUE / 200 {
                                tracing::warn!(depth, "outbound publish queue is backing up");
                            }
                        }
                        None => tracing::debug!("publisher session not yet established"),
                    }
                })
            }),
            config.health_check_interval,
            config.health_check_interval,
        );
    }

    {
        let shared_publisher = shared_publisher.clone();
        scheduler.schedule(
            Arc::new(move || {
                let shared_publisher = shared_publisher.clone();
                Box::pin(async move {
                    if let Some(publisher) = shared_publisher.lock().await.as_ref() {
                        let mut system = sysinfo::System::new_all();
                        system.refresh_all();
                        let snapshot = facts::top_info_snapshot(&system);
                        publisher.publish_top_info(&snapshot).await;
                    }
                })
            }),
            config.top_info_interval,
            config.top_info_interval,
        );
    }

    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, triggering an immediate reconciliation pass");
                scheduler.trigger(reconcile_job_id);
            }
        }
    }

    if let Some(publisher) = shared_publisher.lock().await.as_ref() {
        publisher.publish_clean_disconnect().await;
        publisher.disconnect().await;
    }

    scheduler.shutdown().await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(config.shutdown_timeout, listener_handle).await;

    tracing::info!("shutdown complete");
    Ok(())
}
