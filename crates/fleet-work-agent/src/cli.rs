//! CLI options for the member agent.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser, PartialEq, Eq)]
#[command(
    name = "fleet-work-agent",
    author,
    version,
    about = "Member-cluster agent applying Work manifest bundles"
)]
pub struct RunArguments {
    /// Kubeconfig granting access to the hub cluster. The member cluster is
    /// reached through the in-cluster (or default) configuration.
    #[arg(long, env = "HUB_KUBECONFIG")]
    pub hub_kubeconfig: PathBuf,

    /// The hub namespace reserved for this member cluster, where its Works
    /// are authored.
    #[arg(long, env = "WORK_NAMESPACE")]
    pub work_namespace: String,

    /// This member cluster's name, used by override templates.
    #[arg(long, env = "MEMBER_CLUSTER_NAME")]
    pub member_cluster_name: String,

    /// This member cluster's labels as key=value pairs, matched by override
    /// cluster selectors.
    #[arg(long = "member-cluster-label", value_name = "KEY=VALUE")]
    pub member_cluster_labels: Vec<String>,

    /// Upper bound on Works reconciled in parallel.
    #[arg(long, env = "CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Interval at which every Work is re-reconciled for drift detection,
    /// independent of watch events.
    #[arg(long, env = "SYNC_INTERVAL_SECONDS", default_value_t = 5)]
    pub sync_interval_seconds: u64,
}
