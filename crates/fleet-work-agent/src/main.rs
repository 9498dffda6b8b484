use std::time::Duration;

use clap::Parser;
use kube::{
    Client, Config,
    config::{KubeConfigOptions, Kubeconfig},
};
use snafu::{ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use fleet_work_agent::{
    applier::WorkApplier, cli::RunArguments, controller, discovery::RestMapper,
    member::MemberCluster,
};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to read the hub kubeconfig"))]
    ReadHubKubeconfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("failed to build the hub client configuration"))]
    BuildHubConfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("failed to construct the hub client"))]
    BuildHubClient { source: kube::Error },

    #[snafu(display("failed to construct the member cluster client"))]
    BuildMemberClient { source: kube::Error },

    #[snafu(display("failed to parse the member cluster identity"))]
    MemberIdentity {
        source: fleet_work_agent::member::Error,
    },

    #[snafu(display("failed to warm up member cluster discovery"))]
    WarmUpDiscovery {
        source: fleet_work_agent::discovery::Error,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let arguments = RunArguments::parse();

    let cluster = MemberCluster::from_cli(
        arguments.member_cluster_name.clone(),
        &arguments.member_cluster_labels,
    )
    .context(MemberIdentitySnafu)?;

    let kubeconfig =
        Kubeconfig::read_from(&arguments.hub_kubeconfig).context(ReadHubKubeconfigSnafu)?;
    let hub_config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context(BuildHubConfigSnafu)?;
    let hub_client = Client::try_from(hub_config).context(BuildHubClientSnafu)?;

    let member_client = Client::try_default().await.context(BuildMemberClientSnafu)?;

    let mapper = RestMapper::new(member_client.clone());
    mapper.refresh().await.context(WarmUpDiscoverySnafu)?;

    let applier = WorkApplier {
        hub_client,
        member_client,
        work_namespace: arguments.work_namespace.clone(),
        cluster,
        mapper,
        sync_interval: Duration::from_secs(arguments.sync_interval_seconds),
    };

    tracing::info!(
        member_cluster = %arguments.member_cluster_name,
        work_namespace = %arguments.work_namespace,
        concurrency = arguments.concurrency,
        "starting the work applier"
    );
    controller::run(applier, arguments.concurrency).await;

    Ok(())
}
