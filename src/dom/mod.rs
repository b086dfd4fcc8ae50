pub mod document;
pub mod events;
pub mod host;
pub mod node;
pub mod policy;
pub mod registry;
pub mod styles;

pub use document::SandboxRoot;
pub use events::{dispatch_event, DispatchOutcome, HostEvent};
pub use host::{HostDocument, HostNodeId, Namespace, SharedDocument};
pub use node::DomBridge;
pub use policy::{AllowLists, FilterPolicy};
