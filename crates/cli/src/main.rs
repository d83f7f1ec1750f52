use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::Pod;
use kube::{api::Api, Client, Resource};
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vigil_controller::{Controller, ControllerConfig, Reconciler};
use vigil_core::{ListerWatcher, Object, ObjectKey, Outcome, Selector};
use vigil_kubehub::KubeListerWatcher;

/// Label selector used for Pods when nothing else is configured.
const DEFAULT_POD_SELECTOR: &str = "app=informers-demo";

#[derive(Parser, Debug)]
#[command(name = "vigilctl", version, about = "Vigil controller CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment" (default: Pods)
    #[arg(long = "gvk", global = true)]
    gvk: Option<String>,

    /// Label selector (overrides VIGIL_SELECTOR)
    #[arg(short = 'l', long = "selector", global = true)]
    selector: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller with a logging reconciler until Ctrl-C
    Run(RunArgs),
    /// List matching objects once
    Ls,
}

/// Flags override the matching VIGIL_* environment variables read by
/// `ControllerConfig::from_env`.
#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Number of reconcile workers [env: VIGIL_WORKERS]
    #[arg(long)]
    workers: Option<usize>,
    /// Resync period in seconds, 0 disables [env: VIGIL_RESYNC_SECS]
    #[arg(long = "resync-secs")]
    resync_secs: Option<u64>,
    /// First retry delay after a failed reconcile [env: VIGIL_RETRY_BASE_MS]
    #[arg(long = "retry-base-ms")]
    retry_base_ms: Option<u64>,
    /// Retry delay cap [env: VIGIL_RETRY_MAX_SECS]
    #[arg(long = "retry-max-secs")]
    retry_max_secs: Option<u64>,
    /// Overall requeue rate across all keys [env: VIGIL_QUEUE_QPS]
    #[arg(long = "queue-qps")]
    queue_qps: Option<f64>,
    /// Requeues allowed at once before the rate applies [env: VIGIL_QUEUE_BURST]
    #[arg(long = "queue-burst")]
    queue_burst: Option<u32>,
    /// Delay after a not-ready outcome [env: VIGIL_NOT_READY_MS]
    #[arg(long = "not-ready-ms")]
    not_ready_ms: Option<u64>,
    /// Give up after this many consecutive list/watch failures [env: VIGIL_RELIST_MAX_RETRIES]
    #[arg(long = "relist-max-retries")]
    relist_max_retries: Option<u32>,
    /// First delay after a failed list/watch [env: VIGIL_WATCH_BACKOFF_BASE_MS]
    #[arg(long = "watch-backoff-base-ms")]
    watch_backoff_base_ms: Option<u64>,
    /// List/watch backoff cap [env: VIGIL_WATCH_BACKOFF_MAX_SECS]
    #[arg(long = "watch-backoff-max-secs")]
    watch_backoff_max_secs: Option<u64>,
    /// Delta channel capacity [env: VIGIL_QUEUE_CAP]
    #[arg(long = "queue-cap")]
    queue_cap: Option<usize>,
}

impl RunArgs {
    fn apply(&self, cfg: &mut ControllerConfig) {
        if let Some(n) = self.workers { cfg.workers = n.max(1); }
        if let Some(s) = self.resync_secs { cfg.resync_period = Duration::from_secs(s); }
        if let Some(ms) = self.retry_base_ms { cfg.retry_base_delay = Duration::from_millis(ms); }
        if let Some(s) = self.retry_max_secs { cfg.retry_max_delay = Duration::from_secs(s); }
        if let Some(q) = self.queue_qps.filter(|q| q.is_finite() && *q > 0.0) { cfg.queue_qps = q; }
        if let Some(n) = self.queue_burst { cfg.queue_burst = n.max(1); }
        if let Some(ms) = self.not_ready_ms { cfg.not_ready_delay = Duration::from_millis(ms); }
        if let Some(n) = self.relist_max_retries { cfg.relist_max_retries = Some(n); }
        if let Some(ms) = self.watch_backoff_base_ms { cfg.watch_backoff_base = Duration::from_millis(ms); }
        if let Some(s) = self.watch_backoff_max_secs { cfg.watch_backoff_max = Duration::from_secs(s); }
        if let Some(n) = self.queue_cap { cfg.delta_channel_cap = n.max(1); }
    }
}

fn init_tracing() {
    let env = std::env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VIGIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid VIGIL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Logs every key it is handed; nothing to converge.
struct LogReconciler;

#[async_trait::async_trait]
impl<K: Object> Reconciler<K> for LogReconciler {
    async fn reconcile(&self, key: &ObjectKey, object: Option<Arc<K>>) -> Result<Outcome> {
        match object {
            Some(obj) => {
                let meta = obj.meta();
                let age = render_age(meta.creation_timestamp.as_ref().map(|t| t.0), Utc::now());
                info!(
                    key = %key,
                    rv = meta.resource_version.as_deref().unwrap_or("-"),
                    age = %age,
                    "sync"
                );
            }
            None => info!(key = %key, "deleted"),
        }
        Ok(Outcome::Success)
    }
}

async fn run_controller<K, L>(lister: L, config: ControllerConfig) -> Result<()>
where
    K: Object,
    L: ListerWatcher<K> + 'static,
{
    let shutdown = CancellationToken::new();
    let controller = Controller::new(lister, LogReconciler, config);
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Ctrl-C received; shutting down");
                    shutdown.cancel();
                }
                Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
            }
        }
    });
    controller.run(shutdown).await?;
    Ok(())
}

async fn list_once<K, L>(lister: &L, selector: &Selector, output: Output) -> Result<()>
where
    K: Object + Serialize,
    L: ListerWatcher<K>,
{
    let page = lister.list(selector).await?;
    match output {
        Output::Human => {
            println!("NAMESPACE   NAME                 AGE");
            let now = Utc::now();
            for item in &page.items {
                let meta = item.meta();
                let ns_col = meta.namespace.as_deref().unwrap_or("-");
                let name = meta.name.as_deref().unwrap_or("");
                let age = render_age(meta.creation_timestamp.as_ref().map(|t| t.0), now);
                println!("{:<11} {:<20} {}", ns_col, name, age);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&page.items)?),
    }
    Ok(())
}

async fn execute<K, L>(command: &Commands, lister: L, config: ControllerConfig, output: Output) -> Result<()>
where
    K: Object + Serialize,
    L: ListerWatcher<K> + 'static,
{
    match command {
        Commands::Run(_) => run_controller(lister, config).await,
        Commands::Ls => list_once(&lister, &config.selector, output).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut config = ControllerConfig::from_env();
    if let Commands::Run(args) = &cli.command {
        args.apply(&mut config);
    }
    if let Some(expr) = cli.selector.as_deref() {
        config.selector = Selector::labels(expr);
    } else if config.selector.labels.is_none() && cli.gvk.is_none() {
        config.selector = Selector::labels(DEFAULT_POD_SELECTOR);
    }
    let ns = cli.namespace.as_deref();
    info!(gvk = ?cli.gvk, ns = ?ns, selector = ?config.selector, command = ?cli.command, "vigilctl invoked");

    let client = Client::try_default().await?;
    match cli.gvk.as_deref() {
        None => {
            config.name = "pods".to_string();
            let api: Api<Pod> = match ns {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            };
            execute(&cli.command, KubeListerWatcher::new(api), config, cli.output).await
        }
        Some(gvk) => {
            config.name = gvk.to_string();
            let lister = KubeListerWatcher::dynamic(client, gvk, ns).await?;
            execute(&cli.command, lister, config, cli.output).await
        }
    }
}

fn render_age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (now - created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
