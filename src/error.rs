use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to update label on node {node}: {source}")]
    NodeLabelUpdateFailed {
        node: String,
        #[source]
        source: kube::Error,
    },

    #[error("{0} cache stopped before completing its initial sync")]
    CacheSyncFailed(&'static str),
}
