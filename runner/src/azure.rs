use crate::executors::{CommandRunner, ExecutorError, Invocation};
use tracing::info;

/// Merge the cluster credentials into the local kubeconfig, fatal on failure
pub fn fetch_credentials(
    runner: &dyn CommandRunner,
    cluster: &str,
    subscription: &str,
    resource_group: &str,
) -> Result<(), ExecutorError> {
    let invocation = Invocation::new("az").args([
        "aks",
        "get-credentials",
        "--overwrite-existing",
        "--resource-group",
        resource_group,
        "--subscription",
        subscription,
        "--name",
        cluster,
    ]);

    runner.run(&invocation)?.ensure_success(&invocation)?;
    info!(cluster = cluster, "Fetched cluster credentials");

    Ok(())
}
