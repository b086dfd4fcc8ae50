pub mod builder;
pub mod handle;
pub mod loader;
pub mod marshal;
pub mod runtime;
pub mod timers;

pub use handle::{HandleLedger, SandboxHandle};
pub use marshal::{HostFunction, HostValue, Marshaller};
pub use runtime::QuickJsEngine;
