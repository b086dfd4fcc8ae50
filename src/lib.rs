//! Run untrusted UI scripts in an isolated QuickJS context against a
//! filtered, shadow-rooted view of a host document.

pub mod config;
pub mod dom;
pub mod error;
pub mod js;
pub mod log;
pub mod sandbox;

pub use config::SandboxConfig;
pub use dom::{DispatchOutcome, FilterPolicy, HostDocument, HostEvent, HostNodeId, Namespace};
pub use error::{BridgeError, ConfigError, SandboxError};
pub use js::{HostFunction, HostValue};
pub use log::{Violation, ViolationKind, ViolationLog};
pub use sandbox::{Sandbox, SandboxOptions};
