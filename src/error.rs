use thiserror::Error;

use crate::dom::host::HostNodeId;

/// Violations of the bridge's own bookkeeping. These are fatal for the call
/// that hit them and surface in the script as a thrown `Error`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("missing tracked node for handle (id {0:?})")]
    UntrackedHandle(Option<u32>),
    #[error("host node {host:?} is already tracked as node {existing}")]
    DuplicateHostNode { host: HostNodeId, existing: u32 },
    #[error("node {child} is not a child of node {parent}")]
    NotAChild { parent: u32, child: u32 },
    #[error("missing tracked option element in <select> node {0}")]
    MissingOption(u32),
    #[error("sandbox has been disposed")]
    Disposed,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("QuickJS error: {0}")]
    Engine(#[from] rquickjs::Error),
    #[error("sandboxed source failed: {0}")]
    Evaluation(String),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("sandbox has been disposed")]
    Disposed,
    #[error("sandbox timers require a tokio runtime")]
    NoAsyncRuntime,
    #[error("host document error: {0}")]
    Host(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read sandbox config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid module origin: {0}")]
    InvalidOrigin(#[from] url::ParseError),
}
