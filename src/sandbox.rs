//! One sandbox instance: interpreter, DOM bridge, timers and loader wired
//! together in a fixed order and torn down in the reverse one.

use std::rc::Rc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{sleep_until, Instant};
use url::Url;

use crate::config::SandboxConfig;
use crate::dom::document::{install_root, install_shims, SandboxRoot};
use crate::dom::events::{dispatch_event, DispatchOutcome, HostEvent};
use crate::dom::host::{HostNodeId, SharedDocument};
use crate::dom::node::DomBridge;
use crate::dom::policy::FilterPolicy;
use crate::error::SandboxError;
use crate::js::builder::{build_from_definition, ObjectDefinition};
use crate::js::handle::HandleLedger;
use crate::js::loader::{
    HttpFetcher, ModuleLoader, RuntimeModuleLoader, TrustedOriginLoader, DEFAULT_MODULE_ORIGIN,
    ENTRY_MODULE_NAME,
};
use crate::js::marshal::{HostValue, Marshaller};
use crate::js::runtime::{EngineOptions, QuickJsEngine};
use crate::js::timers::TimerBridge;
use crate::log::ViolationLog;

pub const DEFAULT_MARSHAL_DEPTH: usize = 10;

/// Everything a caller may override when creating a sandbox.
pub struct SandboxOptions {
    pub policy: FilterPolicy,
    /// Replaces the default trusted-origin loader.
    pub loader: Option<Rc<dyn ModuleLoader>>,
    /// Origin the default loader accepts imports from.
    pub module_origin: Option<Url>,
    /// Extra globals, installed after the DOM and timers.
    pub globals: Vec<(String, HostValue)>,
    pub marshal_depth: usize,
    pub engine: EngineOptions,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            policy: FilterPolicy::default(),
            loader: None,
            module_origin: None,
            globals: Vec::new(),
            marshal_depth: DEFAULT_MARSHAL_DEPTH,
            engine: EngineOptions::default(),
        }
    }
}

impl SandboxOptions {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            policy: FilterPolicy::from_allow_lists(config.allow_lists.clone()),
            loader: None,
            module_origin: Some(config.module_origin.clone()),
            globals: Vec::new(),
            marshal_depth: config.marshal_depth,
            engine: EngineOptions {
                memory_limit_bytes: config.memory_limit_bytes,
                max_jobs_per_drain: config.max_jobs_per_drain,
            },
        }
    }

    pub fn with_policy(mut self, policy: FilterPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_loader(mut self, loader: Rc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_global(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.globals.push((name.into(), value.into()));
        self
    }
}

/// A running sandbox mounted under a host container.
///
/// Dropping the sandbox disposes it. Field order keeps every interpreter
/// handle alive only as long as the engine.
pub struct Sandbox {
    document: SharedDocument,
    root: SandboxRoot,
    violations: ViolationLog,
    ledger: HandleLedger,
    bridge: Rc<DomBridge>,
    timers: Rc<TimerBridge>,
    engine: Option<QuickJsEngine>,
}

impl Sandbox {
    /// Build a sandbox under `container` and evaluate `source` as its entry
    /// module. Must be called from within a tokio runtime.
    ///
    /// A failing source is returned as [`SandboxError::Evaluation`]; the
    /// partially built sandbox is torn down before returning.
    pub fn create(
        document: SharedDocument,
        container: HostNodeId,
        source: &str,
        options: SandboxOptions,
    ) -> Result<Self, SandboxError> {
        let handle = Handle::try_current().map_err(|_| SandboxError::NoAsyncRuntime)?;
        let SandboxOptions {
            policy,
            loader,
            module_origin,
            globals,
            marshal_depth,
            engine,
        } = options;

        let engine = QuickJsEngine::with_options(&engine)?;
        let violations = ViolationLog::new();
        let ledger = HandleLedger::new();
        let marshaller = Marshaller::new(marshal_depth, violations.clone());
        let bridge = DomBridge::new(
            Rc::clone(&document),
            policy,
            marshaller.clone(),
            ledger.clone(),
        );
        let timers = Rc::new(TimerBridge::new(handle, ledger.clone(), violations.clone()));

        let root = engine.with_context(|ctx| {
            install_shims(&ctx, &bridge)?;
            install_root(&ctx, &bridge, container)
        });
        let root = match root {
            Ok(root) => root,
            Err(err) => {
                bridge.dispose();
                return Err(err);
            }
        };

        let mut sandbox = Self {
            document,
            root,
            violations: violations.clone(),
            ledger,
            bridge,
            timers,
            engine: Some(engine),
        };

        sandbox.install_timers_and_globals(&marshaller, globals)?;

        let loader = match loader {
            Some(loader) => loader,
            None => {
                let origin = match module_origin {
                    Some(origin) => origin,
                    None => Url::parse(DEFAULT_MODULE_ORIGIN).map_err(anyhow::Error::from)?,
                };
                Rc::new(TrustedOriginLoader::new(
                    origin,
                    Box::new(HttpFetcher::new()),
                    violations,
                ))
            }
        };
        let runtime_loader = RuntimeModuleLoader::new(loader);
        sandbox
            .engine()?
            .set_loader(runtime_loader.clone(), runtime_loader);

        if let Err(err) = sandbox.evaluate_module(ENTRY_MODULE_NAME, source) {
            tracing::error!(target: "quickjs", "sandbox source failed: {err}");
            sandbox.dispose();
            return Err(err);
        }
        tracing::info!(
            target: "sandbox::bridge",
            tracked = sandbox.tracked_node_count(),
            "sandbox running"
        );
        Ok(sandbox)
    }

    fn install_timers_and_globals(
        &self,
        marshaller: &Marshaller,
        globals: Vec<(String, HostValue)>,
    ) -> Result<(), SandboxError> {
        let timers = Rc::clone(&self.timers);
        self.engine()?.with_context(move |ctx| {
            TimerBridge::install(&timers, &ctx)?;
            if globals.is_empty() {
                return Ok(());
            }
            let mut definition = ObjectDefinition::new();
            for (name, value) in globals {
                definition = match value {
                    HostValue::Function(function) => definition.method(name, function),
                    value => definition.constant(name, value),
                };
            }
            build_from_definition(&ctx, marshaller, definition, Some(ctx.globals()))?;
            Ok(())
        })
    }

    fn engine(&self) -> Result<&QuickJsEngine, SandboxError> {
        self.engine.as_ref().ok_or(SandboxError::Disposed)
    }

    /// Evaluate a classic script in the sandbox's context.
    pub fn eval_script<V>(&self, source: &str, filename: &str) -> Result<V, SandboxError>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        self.engine()?.eval_script(source, filename)
    }

    /// Evaluate `source` as a module named `name`. Imports go through the
    /// sandbox's loader.
    pub fn evaluate_module(&self, name: &str, source: &str) -> Result<(), SandboxError> {
        self.engine()?.eval_module(name, source)
    }

    /// Deliver a host event to the listeners along `target`'s path.
    pub fn dispatch_event(
        &self,
        target: HostNodeId,
        event: &HostEvent,
    ) -> Result<DispatchOutcome, SandboxError> {
        dispatch_event(self.engine()?, &self.bridge, target, event)
    }

    /// Run every timer callback that is due, then drain pending jobs until
    /// neither produces more work. Returns the number of callbacks run.
    pub fn pump(&self) -> usize {
        let Ok(engine) = self.engine() else {
            return 0;
        };
        let mut ran = 0;
        loop {
            let timers_ran = self.timers.run_due(engine);
            let jobs_ran = engine.drain_jobs();
            ran += timers_ran;
            if timers_ran == 0 && jobs_ran == 0 {
                break;
            }
        }
        ran
    }

    /// Keep firing timers for `duration`. Returns the number of callbacks run.
    pub async fn run_for(&self, duration: Duration) -> Result<usize, SandboxError> {
        self.engine()?;
        let deadline = Instant::now() + duration;
        let mut ran = self.pump();
        loop {
            tokio::select! {
                _ = self.timers.fired() => ran += self.pump(),
                _ = sleep_until(deadline) => break,
            }
        }
        ran += self.pump();
        Ok(ran)
    }

    /// Tear the sandbox down: detach the mount, release every tracked node
    /// and listener, cancel timers, then drop the interpreter. Safe to call
    /// more than once.
    pub fn dispose(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        if let Err(err) = self.document.borrow_mut().detach(self.root.mount) {
            tracing::warn!(target: "sandbox::bridge", "failed to detach sandbox mount: {err:#}");
        }
        let released = self.bridge.dispose();
        self.timers.dispose();
        engine.run_gc();
        drop(engine);
        tracing::debug!(
            target: "sandbox::bridge",
            released,
            live_handles = self.ledger.live(),
            "sandbox disposed"
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.engine.is_none()
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    /// The closed shadow root holding the sandbox's tree.
    pub fn shadow_root(&self) -> HostNodeId {
        self.root.shadow
    }

    /// The host element behind `createSandboxRootDomElement()`.
    pub fn root_node(&self) -> HostNodeId {
        self.root.root
    }

    pub fn mount(&self) -> HostNodeId {
        self.root.mount
    }

    pub fn tracked_node_count(&self) -> usize {
        self.bridge.tracked_count()
    }

    pub fn listener_count(&self) -> usize {
        self.bridge.listener_count()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.pending_count()
    }

    /// Interpreter handles currently held by the host.
    pub fn live_handles(&self) -> usize {
        self.ledger.live()
    }

    pub fn violations(&self) -> &ViolationLog {
        &self.violations
    }

    /// HTML of the sandbox's shadow tree.
    pub fn inner_html(&self) -> Result<String, SandboxError> {
        Ok(self.document.borrow().inner_html(self.root.shadow)?)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.dispose();
    }
}
