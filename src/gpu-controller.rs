use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gpu_inventory::config::InventoryConfig;
use gpu_inventory::controller::InventoryController;
use gpu_inventory::handler::HandlerChain;
use gpu_inventory::policy::{DeviceApprovalPolicy, ManagedNodesPolicy, PolicyStore};
use gpu_pools::resolve::KubePoolSource;
use gpu_pools::webhook::{self, WebhookConfig};
use gpu_rewriter::proxy::{self, ProxyMode, ProxyState};
use gpu_rewriter::rules::{GroupRule, ResourceRule, RewriteRules};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "gpu-controller",
    about = "GPU control plane: inventory controllers, pool admission, and the API rewriter proxy"
)]
struct Args {
    /// Namespace holding the control-plane workloads (telemetry pods and
    /// NodeFeature objects).
    #[arg(long, env = "GPU_NAMESPACE", default_value = "d8-gpu")]
    namespace: String,

    /// Namespace node events are recorded in.
    #[arg(long, default_value = "default")]
    events_namespace: String,

    /// Pool admission webhook listen address.
    #[arg(long, default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,

    /// Webhook TLS certificate; plain HTTP when unset.
    #[arg(long)]
    webhook_cert: Option<PathBuf>,

    /// Webhook TLS key.
    #[arg(long)]
    webhook_key: Option<PathBuf>,

    /// API rewriter proxy listen address.
    #[arg(long, default_value = "127.0.0.1:23916")]
    proxy_addr: SocketAddr,

    /// Upstream Kubernetes API endpoint the proxy forwards to.
    #[arg(long, default_value = "https://kubernetes.default.svc")]
    upstream: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let client = kube::Client::try_default().await?;

    let policies = Arc::new(PolicyStore::new(
        ManagedNodesPolicy::default(),
        DeviceApprovalPolicy::manual(),
    ));
    let inventory_config = InventoryConfig {
        workloads_namespace: args.namespace.clone(),
        feature_namespace: args.namespace.clone(),
        events_namespace: args.events_namespace.clone(),
    };
    let controller = InventoryController::new(
        client.clone(),
        inventory_config,
        policies.clone(),
        HandlerChain::new(),
    );

    let pool_source = Arc::new(KubePoolSource::new(client.clone()));
    let webhook_config = WebhookConfig {
        addr: args.webhook_addr,
        cert_file: args.webhook_cert.clone(),
        key_file: args.webhook_key.clone(),
    };

    let proxy_state = Arc::new(ProxyState::new(
        Arc::new(rewrite_rules()),
        args.upstream.parse()?,
        ProxyMode::Api,
    ));
    let proxy_addr = args.proxy_addr;

    {
        let effective = policies.current();
        info!(
            managed_label = %effective.managed.label_key,
            managed_by_default = effective.managed.enabled_by_default,
            approval_mode = ?effective.approval.mode,
            webhook = %args.webhook_addr,
            proxy = %proxy_addr,
            upstream = %args.upstream,
            "starting gpu control plane"
        );
    }
    // Container runtimes stop pods with SIGTERM; ctrl-c covers SIGINT.
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = controller.run() => result?,
        _ = webhook::serve(pool_source, webhook_config) => {},
        result = proxy::serve(proxy_state, proxy_addr) => result?,
        _ = tokio::signal::ctrl_c() => info!("received interrupt, shutting down"),
        _ = sigterm.recv() => info!("received termination signal, shutting down"),
    }
    Ok(())
}

/// The production rule set: the public `gpu.deckhouse.io` group is served
/// upstream as `internal.gpu.deckhouse.io`. Kinds keep their names; only
/// the group moves, so CRD names and paths disambiguate the two surfaces.
fn rewrite_rules() -> RewriteRules {
    let resource = |kind: &str, plural: &str, singular: &str, short: &[&str]| ResourceRule {
        kind: kind.to_string(),
        list_kind: format!("{}List", kind),
        plural: plural.to_string(),
        singular: singular.to_string(),
        short_names: short.iter().map(|s| s.to_string()).collect(),
        categories: vec![],
        renamed_kind: kind.to_string(),
        renamed_list_kind: format!("{}List", kind),
        renamed_plural: plural.to_string(),
        renamed_singular: singular.to_string(),
        renamed_short_names: short.iter().map(|s| s.to_string()).collect(),
        versions: vec!["v1alpha1".to_string()],
    };
    RewriteRules {
        groups: vec![GroupRule {
            group: "gpu.deckhouse.io".to_string(),
            renamed_group: "internal.gpu.deckhouse.io".to_string(),
            versions: vec!["v1alpha1".to_string()],
            preferred_version: "v1alpha1".to_string(),
            resources: vec![
                resource("GPUDevice", "gpudevices", "gpudevice", &["gdev"]),
                resource("GPUNodeState", "gpunodestates", "gpunodestate", &["gns"]),
                resource("GPUPool", "gpupools", "gpupool", &[]),
                resource("ClusterGPUPool", "clustergpupools", "clustergpupool", &[]),
                resource(
                    "GPUControllerConfig",
                    "gpucontrollerconfigs",
                    "gpucontrollerconfig",
                    &[],
                ),
            ],
        }],
        labels: Default::default(),
        annotations: Default::default(),
        finalizers: Default::default(),
        services: vec![],
        webhook_paths: vec![
            "/validate/gpudevice".to_string(),
            "/mutate/gpupool".to_string(),
            "/mutate/clustergpupool".to_string(),
        ],
        preserved_prefix: "preserved.gpu.deckhouse.io/".to_string(),
    }
}
