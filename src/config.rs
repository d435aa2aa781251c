//! Operator configuration, read once from the `dotmesh/configuration`
//! ConfigMap at startup. A missing or unreadable map is not an error: the
//! defaults below describe a workable cluster on their own.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use tracing::*;

use crate::common::{DOTMESH_CONFIG_MAP, DOTMESH_NAMESPACE};

pub const CONFIG_NODE_SELECTOR: &str = "nodeSelector";
pub const CONFIG_UPGRADES_URL: &str = "upgradesUrl";
pub const CONFIG_UPGRADES_INTERVAL_SECONDS: &str = "upgradesIntervalSeconds";
pub const CONFIG_FLEXVOLUME_DRIVER_DIR: &str = "flexvolumeDriverDir";
pub const CONFIG_POOL_NAME: &str = "poolName";
pub const CONFIG_LOG_ADDRESS: &str = "logAddress";
pub const CONFIG_MODE: &str = "storageMode";
pub const CONFIG_LOCAL_POOL_SIZE_PER_NODE: &str = "local.poolSizePerNode";
pub const CONFIG_LOCAL_POOL_LOCATION: &str = "local.poolLocation";

/// Value of [`CONFIG_MODE`] selecting node-local pool storage. The only mode
/// currently implemented.
pub const CONFIG_MODE_LOCAL: &str = "local";

const DEFAULTS: &[(&str, &str)] = &[
    (CONFIG_NODE_SELECTOR, ""),
    (CONFIG_UPGRADES_URL, "https://checkpoint.dotmesh.com/"),
    (CONFIG_UPGRADES_INTERVAL_SECONDS, "14400"),
    (
        CONFIG_FLEXVOLUME_DRIVER_DIR,
        "/usr/libexec/kubernetes/kubelet-plugins/volume/exec",
    ),
    (CONFIG_POOL_NAME, "pool"),
    (CONFIG_LOG_ADDRESS, ""),
    (CONFIG_MODE, CONFIG_MODE_LOCAL),
    (CONFIG_LOCAL_POOL_SIZE_PER_NODE, "10G"),
    (CONFIG_LOCAL_POOL_LOCATION, "/var/lib/dotmesh"),
];

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    data: BTreeMap<String, String>,
}

impl OperatorConfig {
    /// Fetch the ConfigMap and fill in defaults. Mutations of the map after
    /// this point only take effect on operator restart.
    pub async fn load(client: &Client) -> Self {
        let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), DOTMESH_NAMESPACE);
        let data = match config_maps.get_opt(DOTMESH_CONFIG_MAP).await {
            Ok(Some(cm)) => cm.data.unwrap_or_default(),
            Ok(None) => {
                info!(
                    "ConfigMap {}/{} not found, using defaults",
                    DOTMESH_NAMESPACE, DOTMESH_CONFIG_MAP
                );
                BTreeMap::new()
            }
            Err(e) => {
                info!(
                    "Error fetching ConfigMap {}/{}: {}, using defaults",
                    DOTMESH_NAMESPACE, DOTMESH_CONFIG_MAP, e
                );
                BTreeMap::new()
            }
        };
        Self::from_data(data)
    }

    pub fn from_data(mut data: BTreeMap<String, String>) -> Self {
        for (key, default) in DEFAULTS {
            match data.get(*key) {
                Some(value) => {
                    info!("Config variable {} set to '{}'", key, value);
                }
                None => {
                    info!(
                        "Config variable {} not specified, defaulting to '{}'",
                        key, default
                    );
                    data.insert(key.to_string(), default.to_string());
                }
            }
        }
        Self { data }
    }

    fn get(&self, key: &str) -> &str {
        // Every recognised key is present after from_data.
        self.data.get(key).map(String::as_str).unwrap_or("")
    }

    /// Label expression restricting which nodes get server pods. Empty means
    /// all nodes.
    pub fn node_selector(&self) -> &str {
        self.get(CONFIG_NODE_SELECTOR)
    }

    pub fn upgrades_url(&self) -> &str {
        self.get(CONFIG_UPGRADES_URL)
    }

    pub fn upgrades_interval_seconds(&self) -> &str {
        self.get(CONFIG_UPGRADES_INTERVAL_SECONDS)
    }

    pub fn flexvolume_driver_dir(&self) -> &str {
        self.get(CONFIG_FLEXVOLUME_DRIVER_DIR)
    }

    pub fn pool_name(&self) -> &str {
        self.get(CONFIG_POOL_NAME)
    }

    pub fn log_address(&self) -> &str {
        self.get(CONFIG_LOG_ADDRESS)
    }

    pub fn storage_mode(&self) -> &str {
        self.get(CONFIG_MODE)
    }

    pub fn pool_size_per_node(&self) -> &str {
        self.get(CONFIG_LOCAL_POOL_SIZE_PER_NODE)
    }

    pub fn pool_location(&self) -> &str {
        self.get(CONFIG_LOCAL_POOL_LOCATION)
    }
}
