use thiserror::Error;

/// Library-facing error type for the discovery/balancing fabric.
///
/// Transient failures inside the registry and publisher are retried and
/// logged internally; they never surface through this type. `MeshError` is
/// reserved for failures a caller must act on at a call boundary: a bad
/// resolver state, no ready sub-connection, or a routing lookup miss.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error("resolver produced zero addresses")]
    BadResolverState,

    #[error("no ready sub-connection available")]
    NoSubConnAvailable,

    #[error("balancer in transient failure: {0}")]
    TransientFailure(String),

    #[error("no instance found for route")]
    NoInstanceFound,

    #[error("the instance {instance_id} is off")]
    InstanceOff { instance_id: String },

    #[error("failed to decode value: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid dial target: {0}")]
    BadTarget(String),
}

pub type Result<T> = std::result::Result<T, MeshError>;

/// Errors surfaced by a `CoordinationStore` implementation.
///
/// The reference store (`store::MemoryStore`) only ever produces
/// `Unavailable`; `Compacted` exists for implementations backed by a real
/// store with history compaction (e.g. etcd), so the registry's resync path
/// has something to react to.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("requested revision has been compacted")]
    Compacted,

    #[error("watch channel closed")]
    ChannelClosed,

    #[error("leader unavailable, watch requires leader")]
    NoLeader,
}
