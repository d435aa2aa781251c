//! Builders for the cluster objects the operator writes. The only one is the
//! per-node server pod.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use crate::common::*;
use crate::config::OperatorConfig;

/// Build the server pod for a node. The pod is pinned to the node through a
/// node selector on the identity label; the kubelet never restarts it, since
/// replacement is this operator's job.
pub fn server_pod(node_identity: &str, config: &OperatorConfig, image: &str) -> corev1::Pod {
    corev1::Pod {
        metadata: ObjectMeta {
            name: Some(server_pod_name(node_identity)),
            namespace: Some(DOTMESH_NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([(
                DOTMESH_POD_ROLE_LABEL.to_string(),
                DOTMESH_ROLE_SERVER.to_string(),
            )])),
            ..ObjectMeta::default()
        },
        spec: Some(corev1::PodSpec {
            host_pid: Some(true),
            node_selector: Some(BTreeMap::from([(
                DOTMESH_NODE_LABEL.to_string(),
                node_identity.to_string(),
            )])),
            tolerations: Some(vec![corev1::Toleration {
                effect: Some("NoSchedule".to_string()),
                operator: Some("Exists".to_string()),
                ..corev1::Toleration::default()
            }]),
            containers: vec![corev1::Container {
                name: "dotmesh-outer".to_string(),
                image: Some(image.to_string()),
                command: Some(vec![
                    "/require_zfs.sh".to_string(),
                    "dotmesh-server".to_string(),
                ]),
                security_context: Some(corev1::SecurityContext {
                    privileged: Some(true),
                    ..corev1::SecurityContext::default()
                }),
                ports: Some(vec![corev1::ContainerPort {
                    name: Some("dotmesh-api".to_string()),
                    container_port: 32607,
                    protocol: Some("TCP".to_string()),
                    ..corev1::ContainerPort::default()
                }]),
                volume_mounts: Some(vec![
                    mount("docker-sock", "/var/run/docker.sock"),
                    mount("run-docker", "/run/docker"),
                    mount("var-lib", "/var/lib"),
                    mount("system-lib", "/system-lib/lib"),
                    mount("dotmesh-kernel-modules", "/bundled-lib"),
                    mount("dotmesh-secret", "/secret"),
                    mount("test-pools-dir", "/dotmesh-test-pools"),
                ]),
                env: Some(vec![
                    corev1::EnvVar {
                        name: "HOSTNAME".to_string(),
                        value_from: Some(corev1::EnvVarSource {
                            field_ref: Some(corev1::ObjectFieldSelector {
                                api_version: Some("v1".to_string()),
                                field_path: "spec.nodeName".to_string(),
                            }),
                            ..corev1::EnvVarSource::default()
                        }),
                        ..corev1::EnvVar::default()
                    },
                    env(
                        "DOTMESH_ETCD_ENDPOINT",
                        "http://dotmesh-etcd-cluster-client.dotmesh.svc.cluster.local:2379",
                    ),
                    env("DOTMESH_DOCKER_IMAGE", image),
                    env(
                        "PATH",
                        "/bundled-lib/sbin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
                    ),
                    env("LD_LIBRARY_PATH", "/bundled-lib/lib:/bundled-lib/usr/lib/"),
                    env("ALLOW_PUBLIC_REGISTRATION", "1"),
                    env(
                        "INITIAL_ADMIN_PASSWORD_FILE",
                        "/secret/dotmesh-admin-password.txt",
                    ),
                    env("INITIAL_ADMIN_API_KEY_FILE", "/secret/dotmesh-api-key.txt"),
                    env("USE_POOL_NAME", config.pool_name()),
                    env("USE_POOL_DIR", config.pool_location()),
                    env("POOL_SIZE", config.pool_size_per_node()),
                    env("LOG_ADDR", config.log_address()),
                    env("DOTMESH_UPGRADES_URL", config.upgrades_url()),
                    env(
                        "DOTMESH_UPGRADES_INTERVAL_SECONDS",
                        config.upgrades_interval_seconds(),
                    ),
                    env("FLEXVOLUME_DRIVER_DIR", config.flexvolume_driver_dir()),
                ]),
                image_pull_policy: Some("Always".to_string()),
                liveness_probe: Some(corev1::Probe {
                    http_get: Some(corev1::HTTPGetAction {
                        path: Some("/status".to_string()),
                        port: IntOrString::Int(32607),
                        ..corev1::HTTPGetAction::default()
                    }),
                    initial_delay_seconds: Some(30),
                    ..corev1::Probe::default()
                }),
                resources: Some(corev1::ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "cpu".to_string(),
                        Quantity("10m".to_string()),
                    )])),
                    ..corev1::ResourceRequirements::default()
                }),
                ..corev1::Container::default()
            }],
            restart_policy: Some("Never".to_string()),
            service_account_name: Some("dotmesh".to_string()),
            volumes: Some(vec![
                host_path_volume("test-pools-dir", "/dotmesh-test-pools"),
                host_path_volume("run-docker", "/var/run/docker"),
                host_path_volume("docker-sock", "/var/run/docker.sock"),
                host_path_volume("var-lib", "/var/lib"),
                host_path_volume("system-lib", "/lib"),
                corev1::Volume {
                    name: "dotmesh-kernel-modules".to_string(),
                    empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
                    ..corev1::Volume::default()
                },
                corev1::Volume {
                    name: "dotmesh-secret".to_string(),
                    secret: Some(corev1::SecretVolumeSource {
                        secret_name: Some("dotmesh".to_string()),
                        ..corev1::SecretVolumeSource::default()
                    }),
                    ..corev1::Volume::default()
                },
            ]),
            ..corev1::PodSpec::default()
        }),
        ..corev1::Pod::default()
    }
}

fn env(name: &str, value: &str) -> corev1::EnvVar {
    corev1::EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..corev1::EnvVar::default()
    }
}

fn mount(name: &str, path: &str) -> corev1::VolumeMount {
    corev1::VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..corev1::VolumeMount::default()
    }
}

fn host_path_volume(name: &str, path: &str) -> corev1::Volume {
    corev1::Volume {
        name: name.to_string(),
        host_path: Some(corev1::HostPathVolumeSource {
            path: path.to_string(),
            type_: None,
        }),
        ..corev1::Volume::default()
    }
}
