//! The decision engine. A one-second ticker gates on the dirty flag and then
//! reconciles the whole world: label nodes, classify server pods, delete the
//! doomed ones under a rolling-restart rate limit, and create pods for nodes
//! that lack one.
//!
//! Each pass works on a snapshot of the caches taken at the top of the pass,
//! and the classify/kill/create decisions are a pure function of that
//! snapshot. A pass is idempotent: with no cluster changes in between,
//! running it again issues no API calls.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{DeleteParams, PostParams};
use kube::runtime::reflector::Store;
use kube::{Api, Client, ResourceExt};
use tokio::sync::watch::Receiver;
use tokio::time::MissedTickBehavior;
use tracing::*;

use crate::common::*;
use crate::config::OperatorConfig;
use crate::error::Error;
use crate::resources;
use crate::watch::{ClusterCaches, DirtyFlag};

const TICK: Duration = Duration::from_secs(1);

const PHASE_RUNNING: &str = "Running";
const PHASE_FAILED: &str = "Failed";

pub struct DotmeshController {
    client: Client,
    nodes: Store<Node>,
    pods: Store<Pod>,
    dirty: Arc<DirtyFlag>,
    config: OperatorConfig,
    image: String,
}

impl DotmeshController {
    pub fn new(
        client: Client,
        caches: &ClusterCaches,
        config: OperatorConfig,
        image: String,
    ) -> Self {
        Self {
            client,
            nodes: caches.nodes.clone(),
            pods: caches.pods.clone(),
            dirty: caches.dirty.clone(),
            config,
            image,
        }
    }

    /// Ticker loop. Errors from a pass are logged and retried on a later
    /// tick; the next watch event or forced resync re-marks the flag.
    pub async fn run(&self, mut shutdown: Receiver<bool>) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
            }
            if self.dirty.take() {
                if let Err(error) = self.process().await {
                    error!("{}", error);
                }
            }
        }
        info!("Stopping reconciler");
    }

    async fn process(&self) -> Result<(), Error> {
        debug!("Analysing cluster status...");

        // Nodes must carry their identity label before pods can be bound to
        // them. A label update failure aborts the pass.
        let node_api: Api<Node> = Api::all(self.client.clone());
        let nodes = self.nodes.state();
        let mut identities = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let identity = ensure_identity_label(&node_api, node).await?;
            trace!("Observing node {} (labelled {})", node.name_any(), identity);
            identities.push(identity);
        }

        let pods = self.pods.state();
        let plan = plan_pass(&identities, &pods, &self.image);

        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), DOTMESH_NAMESPACE);
        for name in &plan.deletions {
            info!("Deleting pod {}", name);
            if let Err(error) = pod_api.delete(name, &DeleteParams::background()).await {
                // Keep pressing on; the next pass retries.
                error!("Failed to delete pod {}: {}", name, error);
            }
        }
        if !plan.spared.is_empty() {
            debug!(
                "{} doomed pods spared this pass to keep the fleet above its minimum",
                plan.spared.len()
            );
        }

        for node in &plan.creations {
            let pod = resources::server_pod(node, &self.config, &self.image);
            info!(
                "Creating pod {} running {} on node {}",
                pod.name_any(),
                self.image,
                node
            );
            if let Err(error) = pod_api.create(&PostParams::default(), &pod).await {
                error!("Failed to create pod on node {}: {}", node, error);
            }
        }

        Ok(())
    }
}

/// Ensure the node carries its identity label and return the canonical
/// identity. The label value, not the raw node name, is what the rest of the
/// pass binds pods to, so an alternative identity source only has to touch
/// this function.
async fn ensure_identity_label(node_api: &Api<Node>, node: &Node) -> Result<String, Error> {
    match relabelled(node) {
        None => Ok(node
            .labels()
            .get(DOTMESH_NODE_LABEL)
            .cloned()
            .unwrap_or_else(|| node.name_any())),
        Some(updated) => {
            let name = node.name_any();
            info!(
                "Labelling unfamiliar node {} so we can bind a dotmesh to it",
                name
            );
            node_api
                .replace(&name, &PostParams::default(), &updated)
                .await
                .map_err(|source| Error::NodeLabelUpdateFailed {
                    node: name.clone(),
                    source,
                })?;
            Ok(name)
        }
    }
}

/// A deep copy of the node with the identity label corrected, or `None` when
/// it is already right.
fn relabelled(node: &Node) -> Option<Node> {
    let name = node.name_any();
    match node.labels().get(DOTMESH_NODE_LABEL) {
        Some(value) if *value == name => None,
        _ => {
            let mut updated = node.clone();
            updated
                .labels_mut()
                .insert(DOTMESH_NODE_LABEL.to_string(), name);
            Some(updated)
        }
    }
}

/// What one reconcile pass has decided to do.
#[derive(Debug, Default)]
pub(crate) struct PassPlan {
    /// Pod names to delete, already filtered by the rolling-restart limit.
    pub deletions: Vec<String>,
    /// Doomed pods kept this pass so the fleet stays above the minimum.
    pub spared: Vec<String>,
    /// Node identities that should receive a new server pod.
    pub creations: Vec<String>,
}

/// Classify every observed pod against the node inventory and decide which
/// pods die and which nodes get a new one. Pure: all cluster effects happen
/// in the caller.
fn plan_pass(identities: &[String], pods: &[Arc<Pod>], image: &str) -> PassPlan {
    // Set of all node identities.
    let valid_nodes: HashSet<&str> = identities.iter().map(String::as_str).collect();

    // Starts as all nodes; identities are struck out as healthy pods are
    // found on them.
    let mut undotted_nodes: HashSet<&str> = valid_nodes.clone();

    // Nodes where a doomed pod is still being torn down; no replacement is
    // started there this pass.
    let mut suspended_nodes: HashSet<String> = HashSet::new();

    // (pod name, was in the running phase)
    let mut to_kill: Vec<(String, bool)> = Vec::new();

    let mut running_pod_count = 0usize;

    for pod in pods {
        let pod_name = pod.name_any();
        let phase = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .unwrap_or("");
        let running = phase == PHASE_RUNNING;
        if running {
            running_pod_count += 1;
        }

        // The node the pod is bound to; if it is still starting up it is not
        // scheduled onto that node yet.
        let bound_node = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_selector.as_ref())
            .and_then(|selector| selector.get(DOTMESH_NODE_LABEL));
        let (Some(spec), Some(bound_node)) = (pod.spec.as_ref(), bound_node) else {
            info!(
                "Observing pod {} - cannot find {} label",
                pod_name, DOTMESH_NODE_LABEL
            );
            to_kill.push((pod_name, running));
            continue;
        };
        let bound_node = bound_node.as_str();

        if spec.containers.len() != 1 {
            info!(
                "Observing pod {} - it has {} containers, should be 1",
                pod_name,
                spec.containers.len()
            );
            to_kill.push((pod_name, running));
            // Don't start a new dotmesh on the node it's SUPPOSED to be on
            // until it's gone.
            suspended_nodes.insert(bound_node.to_string());
            continue;
        }

        let pod_image = spec.containers[0].image.as_deref().unwrap_or("");
        if pod_image != image {
            trace!(
                "Observing pod {} running wrong image {} (should be {})",
                pod_name,
                pod_image,
                image
            );
            to_kill.push((pod_name, running));
            suspended_nodes.insert(bound_node.to_string());
            continue;
        }

        let scheduled_node = spec.node_name.as_deref().unwrap_or("");
        if !scheduled_node.is_empty() && scheduled_node != bound_node {
            info!(
                "Observing pod {} - running on node {} but bound to node {}",
                pod_name, scheduled_node, bound_node
            );
            to_kill.push((pod_name, running));
            suspended_nodes.insert(bound_node.to_string());
            continue;
        }

        if !valid_nodes.contains(bound_node) {
            info!(
                "Observing pod {} - bound to invalid node {}",
                pod_name, bound_node
            );
            // That node is gone; there is no replacement to wait for, so it
            // is not suspended.
            to_kill.push((pod_name, running));
            continue;
        }

        if phase == PHASE_FAILED {
            // The pod is about to be deleted, so the user can't
            // `kubectl describe` it any more; log everything we know.
            let status = pod.status.as_ref();
            info!(
                "Observing pod {} - FAILED (Message: {}) (Reason: {})",
                pod_name,
                status.and_then(|s| s.message.as_deref()).unwrap_or(""),
                status.and_then(|s| s.reason.as_deref()).unwrap_or(""),
            );
            for condition in status.and_then(|s| s.conditions.as_ref()).into_iter().flatten() {
                info!("Failed pod {} - condition {:?}", pod_name, condition);
            }
            for container in status
                .and_then(|s| s.container_statuses.as_ref())
                .into_iter()
                .flatten()
            {
                info!("Failed pod {} - container {:?}", pod_name, container);
            }
            to_kill.push((pod_name, running));
            suspended_nodes.insert(bound_node.to_string());
            continue;
        }

        // A valid dotmesh pod; its node is not undotted.
        trace!(
            "Observing pod {} running {} on {} (status: {})",
            pod_name,
            pod_image,
            bound_node,
            phase
        );
        undotted_nodes.remove(bound_node);
    }

    let dotted_node_count = valid_nodes.len() - undotted_nodes.len();
    debug!(
        "{} healthy-looking dotmeshes exist to run on {} nodes; {} of them seem to be actually \
         running; {} dotmeshes need deleting, and {} nodes are temporarily suspended out of {} \
         undotted",
        dotted_node_count,
        valid_nodes.len(),
        running_pod_count,
        to_kill.len(),
        suspended_nodes.len(),
        undotted_nodes.len()
    );

    // Rate-limit the killing of running pods into a rolling restart: never
    // delete so many in one pass that fewer than the minimum are left
    // running. Pods that are not running contribute nothing to the fleet and
    // are deleted unconditionally.
    let minimum_population = (CLUSTER_MINIMUM_RATIO * valid_nodes.len() as f64) as usize;
    let mut population = running_pod_count;
    debug!(
        "{}/{} nodes might just be running or getting there, minimum target is {}",
        population,
        valid_nodes.len(),
        minimum_population
    );

    let mut plan = PassPlan::default();
    for (pod_name, running) in to_kill {
        if !running || population > minimum_population {
            if running {
                population -= 1;
            }
            plan.deletions.push(pod_name);
        } else {
            info!(
                "Sparing pod {} to rate-limit the deletion of running pods",
                pod_name
            );
            plan.spared.push(pod_name);
        }
    }

    for identity in identities {
        if !undotted_nodes.contains(identity.as_str()) {
            continue;
        }
        if suspended_nodes.contains(identity) {
            info!(
                "Not creating a pod on undotted node {}, as the old pod is being cleared up",
                identity
            );
            continue;
        }
        plan.creations.push(identity.clone());
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    const IMAGE: &str = "dotmesh/dotmesh-server:test";

    fn identities(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    struct PodBuilder {
        pod: Pod,
    }

    impl PodBuilder {
        fn new(name: &str) -> Self {
            Self {
                pod: Pod {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(DOTMESH_NAMESPACE.to_string()),
                        ..ObjectMeta::default()
                    },
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "dotmesh-outer".to_string(),
                            image: Some(IMAGE.to_string()),
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                    ..Pod::default()
                },
            }
        }

        fn bound_to(mut self, node: &str) -> Self {
            self.pod.spec.as_mut().unwrap().node_selector = Some(BTreeMap::from([(
                DOTMESH_NODE_LABEL.to_string(),
                node.to_string(),
            )]));
            self
        }

        fn scheduled_on(mut self, node: &str) -> Self {
            self.pod.spec.as_mut().unwrap().node_name = Some(node.to_string());
            self
        }

        fn image(mut self, image: &str) -> Self {
            self.pod.spec.as_mut().unwrap().containers[0].image = Some(image.to_string());
            self
        }

        fn phase(mut self, phase: &str) -> Self {
            self.pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                ..PodStatus::default()
            });
            self
        }

        fn extra_container(mut self) -> Self {
            self.pod
                .spec
                .as_mut()
                .unwrap()
                .containers
                .push(Container::default());
            self
        }

        fn build(self) -> Arc<Pod> {
            Arc::new(self.pod)
        }
    }

    /// A pod the pass should consider healthy: right image, bound and
    /// scheduled on the same node, running.
    fn healthy_pod(node: &str) -> Arc<Pod> {
        PodBuilder::new(&server_pod_name(node))
            .bound_to(node)
            .scheduled_on(node)
            .phase(PHASE_RUNNING)
            .build()
    }

    #[test]
    fn cold_start_creates_a_pod_per_node() {
        let plan = plan_pass(&identities(&["n1", "n2", "n3"]), &[], IMAGE);

        assert!(plan.deletions.is_empty());
        assert!(plan.spared.is_empty());
        assert_eq!(plan.creations, vec!["n1", "n2", "n3"]);
    }

    #[test]
    fn converged_cluster_plans_nothing() {
        let ids = identities(&["n1", "n2"]);
        let pods = vec![healthy_pod("n1"), healthy_pod("n2")];

        let plan = plan_pass(&ids, &pods, IMAGE);

        assert!(plan.deletions.is_empty());
        assert!(plan.spared.is_empty());
        assert!(plan.creations.is_empty());
    }

    #[test]
    fn factory_output_is_classified_healthy() {
        let config = OperatorConfig::from_data(BTreeMap::new());
        let pod = Arc::new(resources::server_pod("n1", &config, IMAGE));

        let plan = plan_pass(&identities(&["n1"]), &[pod], IMAGE);

        assert!(plan.deletions.is_empty());
        assert!(plan.creations.is_empty());
    }

    #[test]
    fn rolling_upgrade_deletes_one_pod_per_pass_of_four() {
        let ids = identities(&["n1", "n2", "n3", "n4"]);
        let pods: Vec<_> = ["n1", "n2", "n3", "n4"]
            .iter()
            .map(|n| {
                PodBuilder::new(&server_pod_name(n))
                    .bound_to(n)
                    .scheduled_on(n)
                    .image("dotmesh/dotmesh-server:old")
                    .phase(PHASE_RUNNING)
                    .build()
            })
            .collect();

        // First pass: minimum population is 3 of 4, so exactly one running
        // pod may die, and every node is suspended by its doomed pod.
        let plan = plan_pass(&ids, &pods, IMAGE);
        assert_eq!(plan.deletions.len(), 1);
        assert_eq!(plan.spared.len(), 3);
        assert!(plan.creations.is_empty());

        // Second pass, once the deleted pod is gone: its node is free again,
        // and the three survivors stay spared at the population floor.
        let deleted = plan.deletions[0].clone();
        let remaining: Vec<_> = pods
            .iter()
            .filter(|p| p.name_any() != deleted)
            .cloned()
            .collect();
        let plan = plan_pass(&ids, &remaining, IMAGE);
        assert!(plan.deletions.is_empty());
        assert_eq!(plan.spared.len(), 3);
        assert_eq!(plan.creations.len(), 1);
        let freed = plan.creations[0].clone();
        assert_eq!(server_pod_name(&freed), deleted);

        // Third pass, once the replacement runs: population is back above
        // the floor, so the next deletion is permitted.
        let mut next: Vec<_> = remaining.clone();
        next.push(healthy_pod(&freed));
        let plan = plan_pass(&ids, &next, IMAGE);
        assert_eq!(plan.deletions.len(), 1);
        assert_eq!(plan.spared.len(), 2);
    }

    #[test]
    fn running_deletions_never_breach_the_population_floor() {
        // Invariant: at most max(0, running - floor(0.75 * nodes)) running
        // pods are deleted in one pass.
        for node_count in 1..=6 {
            let names: Vec<String> = (1..=node_count).map(|i| format!("n{}", i)).collect();
            let ids: Vec<String> = names.clone();
            let pods: Vec<_> = names
                .iter()
                .map(|n| {
                    PodBuilder::new(&server_pod_name(n))
                        .bound_to(n)
                        .scheduled_on(n)
                        .image("old")
                        .phase(PHASE_RUNNING)
                        .build()
                })
                .collect();

            let plan = plan_pass(&ids, &pods, IMAGE);
            let floor = (CLUSTER_MINIMUM_RATIO * node_count as f64) as usize;
            assert_eq!(plan.deletions.len(), node_count - floor);
            assert_eq!(plan.spared.len(), floor);
        }
    }

    #[test]
    fn pod_on_a_removed_node_is_deleted_without_suspension() {
        // n4 has left the cluster; its pod still counts as running, but the
        // shrunk node set lowers the floor, so it dies on the first pass.
        let ids = identities(&["n1", "n2", "n3"]);
        let mut pods: Vec<_> = ["n1", "n2", "n3"].iter().map(|n| healthy_pod(n)).collect();
        pods.push(healthy_pod("n4"));

        let plan = plan_pass(&ids, &pods, IMAGE);

        assert_eq!(plan.deletions, vec![server_pod_name("n4")]);
        assert!(plan.spared.is_empty());
        // A gone node never blocks creations elsewhere.
        assert!(plan.creations.is_empty());
    }

    #[test]
    fn gone_node_pod_is_still_rate_limited_at_the_floor() {
        // Two valid nodes (floor 1), and the only running pod sits on a node
        // that no longer exists: deleting it would empty the fleet, so it is
        // spared until replacements come up.
        let ids = identities(&["n1", "n2"]);
        let pods = vec![healthy_pod("gone")];

        let plan = plan_pass(&ids, &pods, IMAGE);

        assert!(plan.deletions.is_empty());
        assert_eq!(plan.spared, vec![server_pod_name("gone")]);
        assert_eq!(plan.creations, vec!["n1", "n2"]);
    }

    #[test]
    fn failed_pod_is_deleted_and_suspends_its_node() {
        let ids = identities(&["n1", "n2"]);
        let pods = vec![
            healthy_pod("n1"),
            PodBuilder::new(&server_pod_name("n2"))
                .bound_to("n2")
                .scheduled_on("n2")
                .phase(PHASE_FAILED)
                .build(),
        ];

        let plan = plan_pass(&ids, &pods, IMAGE);

        // Not running, so the floor does not protect it.
        assert_eq!(plan.deletions, vec![server_pod_name("n2")]);
        // n2 is suspended until the teardown is observed.
        assert!(plan.creations.is_empty());
    }

    #[test]
    fn duplicate_healthy_pods_on_one_node_both_survive() {
        let ids = identities(&["n1"]);
        let pods = vec![
            PodBuilder::new("dotmesh-n1")
                .bound_to("n1")
                .scheduled_on("n1")
                .phase(PHASE_RUNNING)
                .build(),
            PodBuilder::new("dotmesh-n1-extra")
                .bound_to("n1")
                .scheduled_on("n1")
                .phase(PHASE_RUNNING)
                .build(),
        ];

        let plan = plan_pass(&ids, &pods, IMAGE);

        assert!(plan.deletions.is_empty());
        assert!(plan.creations.is_empty());
    }

    #[test]
    fn pod_without_node_selector_is_deleted() {
        let ids = identities(&["n1"]);
        let pods = vec![PodBuilder::new("stray").phase(PHASE_RUNNING).build()];

        let plan = plan_pass(&ids, &pods, IMAGE);

        assert_eq!(plan.deletions, vec!["stray"]);
        // Nothing to suspend; n1 still gets its pod.
        assert_eq!(plan.creations, vec!["n1"]);
    }

    #[test]
    fn pod_with_extra_containers_is_deleted_and_suspends() {
        let ids = identities(&["n1"]);
        let pods = vec![
            PodBuilder::new("dotmesh-n1")
                .bound_to("n1")
                .extra_container()
                .build(),
        ];

        let plan = plan_pass(&ids, &pods, IMAGE);

        assert_eq!(plan.deletions, vec!["dotmesh-n1"]);
        assert!(plan.creations.is_empty());
    }

    #[test]
    fn mis_scheduled_pod_is_deleted_and_suspends_its_bound_node() {
        let ids = identities(&["n1", "n2"]);
        let pods = vec![
            PodBuilder::new("dotmesh-n1")
                .bound_to("n1")
                .scheduled_on("n2")
                .build(),
        ];

        let plan = plan_pass(&ids, &pods, IMAGE);

        assert_eq!(plan.deletions, vec!["dotmesh-n1"]);
        // n1 waits for the teardown; n2 never had a bound pod.
        assert_eq!(plan.creations, vec!["n2"]);
    }

    #[test]
    fn pending_pod_keeps_its_node_dotted() {
        let ids = identities(&["n1"]);
        let pods = vec![
            PodBuilder::new("dotmesh-n1")
                .bound_to("n1")
                .phase("Pending")
                .build(),
        ];

        let plan = plan_pass(&ids, &pods, IMAGE);

        assert!(plan.deletions.is_empty());
        assert!(plan.creations.is_empty());
    }

    #[test]
    fn doomed_pending_pod_is_deleted_even_at_the_floor() {
        // Not running means no fleet capacity, so the rate limit never
        // spares it.
        let ids = identities(&["n1", "n2", "n3", "n4"]);
        let pods = vec![
            PodBuilder::new("dotmesh-n1")
                .bound_to("n1")
                .image("old")
                .phase("Pending")
                .build(),
        ];

        let plan = plan_pass(&ids, &pods, IMAGE);

        assert_eq!(plan.deletions, vec!["dotmesh-n1"]);
        assert!(plan.spared.is_empty());
        assert_eq!(plan.creations, vec!["n2", "n3", "n4"]);
    }

    #[test]
    fn single_node_cluster_floor_is_zero() {
        // floor(0.75 * 1) = 0: the sole running pod is deletable.
        let ids = identities(&["n1"]);
        let pods = vec![
            PodBuilder::new("dotmesh-n1")
                .bound_to("n1")
                .scheduled_on("n1")
                .image("old")
                .phase(PHASE_RUNNING)
                .build(),
        ];

        let plan = plan_pass(&ids, &pods, IMAGE);

        assert_eq!(plan.deletions, vec!["dotmesh-n1"]);
        assert!(plan.creations.is_empty());
    }

    #[test]
    fn relabel_sets_a_missing_identity_label() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                ..ObjectMeta::default()
            },
            ..Node::default()
        };

        let updated = relabelled(&node).expect("unlabelled node needs an update");
        assert_eq!(
            updated.labels().get(DOTMESH_NODE_LABEL),
            Some(&"n1".to_string())
        );
    }

    #[test]
    fn relabel_fixes_a_stale_identity_label() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                labels: Some(BTreeMap::from([(
                    DOTMESH_NODE_LABEL.to_string(),
                    "old-name".to_string(),
                )])),
                ..ObjectMeta::default()
            },
            ..Node::default()
        };

        let updated = relabelled(&node).expect("stale label needs an update");
        assert_eq!(
            updated.labels().get(DOTMESH_NODE_LABEL),
            Some(&"n1".to_string())
        );
    }

    #[test]
    fn correctly_labelled_node_is_left_alone() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                labels: Some(BTreeMap::from([(
                    DOTMESH_NODE_LABEL.to_string(),
                    "n1".to_string(),
                )])),
                ..ObjectMeta::default()
            },
            ..Node::default()
        };

        assert!(relabelled(&node).is_none());
    }
}
