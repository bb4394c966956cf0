//! kenv operator - converges declared Tenants on the cluster it runs in

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kenv_common::crd::Tenant;
use kenv_common::kube_utils::{create_client, ensure_tenant_crd};
use kenv_common::telemetry::{init_telemetry, TelemetryConfig};
use kenv_common::TENANT_CONTROLLER;
use kenv_tenant::{ReconcilerConfig, TenantKubeClientImpl, TenantReconciler};

/// kenv - tenant isolation for environment clusters
#[derive(Parser, Debug)]
#[command(name = "kenv-operator", version, about, long_about = None)]
struct Cli {
    /// Print the Tenant CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "KENV_LOG_TEXT")]
    log_text: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tenant reconciler (default mode)
    Controller(ControllerArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Seconds between reconcile passes
    #[arg(long, env = "KENV_INTERVAL_SECS", default_value_t = 30)]
    interval_secs: u64,

    /// Bound on each cluster call, in seconds
    #[arg(long, env = "KENV_CALL_TIMEOUT_SECS", default_value_t = 10)]
    call_timeout_secs: u64,

    /// Delete managed namespaces no Tenant declares any more
    #[arg(long, env = "KENV_PRUNE_NAMESPACES")]
    prune_namespaces: bool,

    /// Kubeconfig to use instead of in-cluster or ~/.kube/config
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

impl ControllerArgs {
    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            call_timeout: Duration::from_secs(self.call_timeout_secs.max(1)),
            prune_namespaces: self.prune_namespaces,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Tenant::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install the aws-lc-rs crypto provider");
    }

    init_telemetry(TelemetryConfig {
        service_name: "kenv-operator".to_string(),
        json: !cli.log_text,
    })?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => {
            run_controller(ControllerArgs {
                interval_secs: 30,
                call_timeout_secs: 10,
                prune_namespaces: false,
                kubeconfig: None,
            })
            .await
        }
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = create_client(args.kubeconfig.as_deref()).await?;
    ensure_tenant_crd(&client, TENANT_CONTROLLER).await?;

    let reconciler = TenantReconciler::new(
        Arc::new(TenantKubeClientImpl::new(client)),
        args.reconciler_config(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested, finishing current pass"),
                Err(e) => warn!(error = %e, "signal handler failed, stopping"),
            }
            cancel.cancel();
        }
    });

    reconciler.run(cancel).await;
    Ok(())
}
