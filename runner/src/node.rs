use crate::{
    config::Cluster,
    executors::ExecutorError,
    ingest::RunOutput,
    kubectl::{resource_names, Kubectl},
};
use tracing::{debug, info, instrument, warn};

/// Run `command` in the root filesystem of `node` (the first node of the cluster
/// if none is given) through an ephemeral debug pod, then remove that pod.
#[instrument(skip(kubectl), fields(cluster = %kubectl.context()), level = "info")]
pub fn execute_on_node(
    kubectl: &Kubectl,
    node: Option<&str>,
    image: &str,
    command: &str,
    args: &[String],
    interactive: bool,
) -> Result<RunOutput, ExecutorError> {
    let node = match node {
        Some(node) => node.to_string(),
        None => first_node(kubectl)?,
    };

    info!(node = %node, "Running {command} on node");
    let result = kubectl.debug_node(&node, image, command, args, interactive);
    // a timed out session leaves its pod behind just as well
    remove_debug_pods(kubectl, &node);

    result
}

fn first_node(kubectl: &Kubectl) -> Result<String, ExecutorError> {
    let output = kubectl.get_nodes()?;

    resource_names(&output.stdout)
        .into_iter()
        .next()
        .ok_or_else(|| ExecutorError::NoNodes {
            context: kubectl.context().to_string(),
        })
}

/// delete the `node-debugger-<node>-*` pods left behind by `kubectl debug`
fn remove_debug_pods(kubectl: &Kubectl, node: &str) {
    let prefix = format!("node-debugger-{node}-");

    let pods = match kubectl.get_pods(None) {
        Ok(output) if output.success() => resource_names(&output.stdout),
        Ok(output) => {
            warn!(output = %output.combined(), "Failed to list debug pods");
            return;
        }
        Err(error) => {
            warn!(error = %error, "Failed to list debug pods");
            return;
        }
    };

    for pod in pods.iter().filter(|pod| pod.starts_with(&prefix)) {
        match kubectl.delete_pod(pod) {
            Ok(output) if output.success() => debug!(pod = %pod, "Removed debug pod"),
            Ok(output) => warn!(pod = %pod, output = %output.combined(), "Failed to remove debug pod"),
            Err(error) => warn!(pod = %pod, error = %error, "Failed to remove debug pod"),
        }
    }
}

/// Switch the virtio-fs cache of a Kata cluster between `auto` and `none`.
/// Clusters without a Kata runtime class are skipped. Returns whether the
/// configuration was rewritten.
pub fn set_kata_cache(
    kubectl: &Kubectl,
    cluster: &Cluster,
    image: &str,
    enable: bool,
) -> Result<bool, ExecutorError> {
    let path = match cluster.kata_config_path() {
        Some(path) => path,
        None => {
            debug!(cluster = %cluster.name, "Not a Kata cluster, leaving it alone");
            return Ok(false);
        }
    };

    let value = if enable { "auto" } else { "none" };
    let expression = format!(r#"s/virtio_fs_cache\s\+=\s\+".*"/virtio_fs_cache = "{value}"/"#);
    let output = execute_on_node(
        kubectl,
        None,
        image,
        "sed",
        &[
            String::from("-i"),
            expression,
            path.to_string_lossy().into_owned(),
        ],
        false,
    )?;

    if output.success() {
        info!(cluster = %cluster.name, "Set virtio_fs_cache to {value}");
    } else {
        warn!(
            cluster = %cluster.name,
            output = %output.combined(),
            "Failed to set virtio_fs_cache"
        );
    }

    Ok(output.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::scripted::{failed, ok, ScriptedRunner};
    use std::{sync::Arc, time::Duration};

    const NODES: &str = "NAME                                STATUS   ROLES   AGE   VERSION
aks-nodepool1-1234-vmss000000       Ready    agent   2d    v1.27.7
aks-nodepool1-1234-vmss000001       Ready    agent   2d    v1.27.7
";

    const PODS: &str = "NAME                                                  READY   STATUS      RESTARTS   AGE
fio-test-q9w4d                                        0/1     Completed   0          1m
node-debugger-aks-nodepool1-1234-vmss000000-8k2lp     0/1     Completed   0          5s
node-debugger-aks-nodepool1-1234-vmss000001-zz9f1     0/1     Completed   0          3h
";

    fn kubectl(runner: ScriptedRunner) -> (Arc<ScriptedRunner>, Kubectl) {
        let runner = Arc::new(runner);
        let kubectl = Kubectl::new(runner.clone(), "aks-benchmark-kata-2", Duration::from_secs(5));

        (runner, kubectl)
    }

    #[test]
    fn resolves_first_node_and_cleans_up() {
        let (runner, kubectl) = kubectl(
            ScriptedRunner::new()
                .on("get nodes", ok(NODES))
                .on("get pods", ok(PODS)),
        );

        let output = execute_on_node(
            &kubectl,
            None,
            "docker.io/library/alpine",
            "sysctl",
            &[String::from("vm.drop_caches=3")],
            false,
        )
        .unwrap();

        assert!(output.success());
        assert_eq!(
            runner.calls()[1],
            "kubectl --context=aks-benchmark-kata-2 debug node/aks-nodepool1-1234-vmss000000 --image=docker.io/library/alpine --attach=true -- chroot /host sysctl vm.drop_caches=3"
        );
        assert_eq!(runner.count("delete pod"), 1);
        assert_eq!(
            runner.count("delete pod node-debugger-aks-nodepool1-1234-vmss000000-8k2lp"),
            1
        );
    }

    #[test]
    fn explicit_node_skips_lookup() {
        let (runner, kubectl) = kubectl(ScriptedRunner::new());

        execute_on_node(&kubectl, Some("aks-nodepool1-1234-vmss000001"), "alpine", "true", &[], false)
            .unwrap();

        assert_eq!(runner.count("get nodes"), 0);
        assert_eq!(runner.count("debug node/aks-nodepool1-1234-vmss000001"), 1);
    }

    #[test]
    fn cleans_up_after_timed_out_session() {
        let (runner, kubectl) = kubectl(
            ScriptedRunner::new()
                .on("get pods", ok(PODS))
                .on_timeout("debug node/"),
        );

        let error = execute_on_node(
            &kubectl,
            Some("aks-nodepool1-1234-vmss000000"),
            "alpine",
            "sleep",
            &[String::from("600")],
            false,
        )
        .unwrap_err();

        assert!(matches!(error, ExecutorError::Timeout { .. }));
        assert_eq!(
            runner.count("delete pod node-debugger-aks-nodepool1-1234-vmss000000-8k2lp"),
            1
        );
        assert_eq!(runner.count("delete pod"), 1);
    }

    #[test]
    fn node_listing_failure_is_fatal() {
        let (runner, kubectl) =
            kubectl(ScriptedRunner::new().on("get nodes", failed(1, "Unauthorized")));

        let error = execute_on_node(&kubectl, None, "alpine", "true", &[], false).unwrap_err();

        assert!(matches!(error, ExecutorError::Fatal { code: 1, .. }));
        assert_eq!(runner.count("debug"), 0);
    }

    #[test]
    fn empty_cluster_has_no_nodes() {
        let (_runner, kubectl) = kubectl(ScriptedRunner::new().on("get nodes", ok("")));

        assert!(matches!(
            execute_on_node(&kubectl, None, "alpine", "true", &[], false),
            Err(ExecutorError::NoNodes { .. })
        ));
    }

    #[test]
    fn toggles_kata_cache() {
        let (runner, kubectl) = kubectl(ScriptedRunner::new().on("get nodes", ok(NODES)));
        let cluster = Cluster::new("aks-benchmark-kata-2", Some(String::from("kata-qemu")));

        assert!(set_kata_cache(&kubectl, &cluster, "alpine", false).unwrap());

        let debug = runner
            .calls()
            .into_iter()
            .find(|call| call.contains("debug node/"))
            .unwrap();
        assert!(debug.ends_with(
            r#"chroot /host sed -i s/virtio_fs_cache\s\+=\s\+".*"/virtio_fs_cache = "none"/ /opt/kata/share/defaults/kata-containers/configuration-qemu.toml"#
        ));
    }

    #[test]
    fn runc_cluster_is_skipped() {
        let (runner, kubectl) = kubectl(ScriptedRunner::new());

        assert!(!set_kata_cache(&kubectl, &Cluster::new("aks-benchmark-containerd-2", None), "alpine", true).unwrap());
        assert!(runner.calls().is_empty());
    }
}
