//! Names and labels shared across the operator.
//!
//! The operator holds no persistent state of its own: everything it owns in
//! the cluster is found again after a restart purely through these labels.

/// Namespace the operator manages; server pods and the config map live here.
pub const DOTMESH_NAMESPACE: &str = "dotmesh";

/// Name of the operator's ConfigMap within [`DOTMESH_NAMESPACE`].
pub const DOTMESH_CONFIG_MAP: &str = "configuration";

/// Identity label placed on every tracked node; its value is the node name.
/// Server pods are bound to their node through a node selector on this label.
pub const DOTMESH_NODE_LABEL: &str = "dotmesh.io/node";

/// Role label marking the pods this operator owns.
pub const DOTMESH_POD_ROLE_LABEL: &str = "dotmesh.io/role";

/// Value of [`DOTMESH_POD_ROLE_LABEL`] for server pods.
pub const DOTMESH_ROLE_SERVER: &str = "dotmesh-server";

/// When restarting pods, keep at least this fraction of the nodes running one.
pub const CLUSTER_MINIMUM_RATIO: f64 = 0.75;

/// Environment variable naming the server image this operator deploys.
pub const DOTMESH_IMAGE_VAR: &str = "DOTMESH_IMAGE";

pub fn server_pod_name(node_identity: &str) -> String {
    format!("dotmesh-{}", node_identity)
}

pub fn role_selector() -> String {
    format!("{}={}", DOTMESH_POD_ROLE_LABEL, DOTMESH_ROLE_SERVER)
}
