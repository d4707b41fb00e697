use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::Client;
use kube_readiness::cloud::cache::CachedCloud;
use kube_readiness::cloud::CloudProvider;
use kube_readiness::controller::watch::{forward_events, scoped_api};
use kube_readiness::controller::{KubeCluster, ResourceKind};
use kube_readiness::model::ReadinessGate;
use kube_readiness::server::{
    create_metrics, run_health_server, run_leader_election, shutdown_channel,
    trigger_on_os_signal, LeaderConfig, LeaderState, ReadinessState, SharedMetrics,
};
use kube_readiness::{Config, Context, Engine};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Watch events buffered between the watchers and the engine
const EVENT_CHANNEL_CAPACITY: usize = 1024;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(feature = "aws")]
async fn build_cloud(
    config: &Config,
    metrics: SharedMetrics,
) -> anyhow::Result<Arc<dyn CloudProvider>> {
    use kube_readiness::cloud::aws::AwsCloud;

    let cloud = AwsCloud::new(
        &config.aws_region,
        config.assume_role_arn.as_deref(),
        metrics,
    )
    .await;
    info!(
        region = %config.aws_region,
        assume_role = config.assume_role_arn.is_some(),
        "AWS ELBv2 backend configured"
    );
    Ok(Arc::new(cloud))
}

#[cfg(not(feature = "aws"))]
async fn build_cloud(
    _config: &Config,
    _metrics: SharedMetrics,
) -> anyhow::Result<Arc<dyn CloudProvider>> {
    anyhow::bail!("built without a cloud backend, enable the `aws` feature")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.log_json);

    info!(
        gate = %config.gate,
        namespace = config.namespace.as_deref().unwrap_or("*"),
        "Starting kube-readiness controller"
    );

    let metrics = create_metrics()?;
    let readiness = ReadinessState::new();

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let mut cloud = build_cloud(&config, metrics.clone()).await?;
    if config.sdk_cache {
        info!("Cloud response cache enabled");
        cloud = Arc::new(CachedCloud::new(cloud, metrics.clone()));
    }

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(trigger_on_os_signal(trigger.clone()));

    let leader = LeaderState::new();
    if config.leader_election {
        tokio::spawn(run_leader_election(
            client.clone(),
            LeaderConfig::from_env(),
            leader.clone(),
            shutdown.clone(),
        ));

        info!("Waiting for leadership");
        let mut waiting = shutdown.clone();
        tokio::select! {
            _ = leader.wait_until_leader() => {}
            _ = waiting.wait() => {
                info!("Shut down before acquiring leadership");
                return Ok(());
            }
        }

        let lost = leader.clone();
        let lost_trigger = trigger.clone();
        tokio::spawn(async move {
            lost.wait_until_lost().await;
            warn!("Leadership lost, shutting down");
            lost_trigger.trigger();
        });
    } else {
        leader.set_leader(true);
    }

    let ctx = Context::new(
        Arc::new(KubeCluster::new(client.clone())),
        cloud,
        ReadinessGate::new(config.gate.clone()),
        metrics,
    )
    .with_call_timeout(config.call_timeout);
    let engine = Arc::new(Engine::new(ctx, &config));

    let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let namespace = config.namespace.as_deref();
    tokio::spawn(forward_events(
        scoped_api::<Pod>(client.clone(), namespace),
        ResourceKind::Pod,
        events.clone(),
    ));
    tokio::spawn(forward_events(
        scoped_api::<Service>(client.clone(), namespace),
        ResourceKind::Service,
        events.clone(),
    ));
    tokio::spawn(forward_events(
        scoped_api::<Endpoints>(client.clone(), namespace),
        ResourceKind::Endpoints,
        events.clone(),
    ));
    tokio::spawn(forward_events(
        scoped_api::<Ingress>(client, namespace),
        ResourceKind::Ingress,
        events,
    ));

    info!("Controller ready, starting reconciliation");
    readiness.while_running(engine.run(rx, shutdown)).await;
    info!("Controller stopped");
    Ok(())
}
