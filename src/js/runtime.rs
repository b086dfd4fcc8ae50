use rquickjs::loader::{Loader, Resolver};
use rquickjs::{Context, Ctx, Error as JsError, FromJs, Module, Persistent, Runtime, Value};

use crate::error::SandboxError;

pub const DEFAULT_MAX_JOBS_PER_DRAIN: usize = 1000;

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub memory_limit_bytes: Option<usize>,
    pub max_jobs_per_drain: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            memory_limit_bytes: None,
            max_jobs_per_drain: DEFAULT_MAX_JOBS_PER_DRAIN,
        }
    }
}

/// One isolated QuickJS runtime with a single context.
///
/// Every call into the interpreter goes through [`QuickJsEngine::with_context`];
/// pending promise jobs are only drained from outside a context scope.
pub struct QuickJsEngine {
    runtime: Runtime,
    context: Context,
    max_jobs: usize,
}

impl QuickJsEngine {
    pub fn new() -> Result<Self, SandboxError> {
        Self::with_options(&EngineOptions::default())
    }

    pub fn with_options(options: &EngineOptions) -> Result<Self, SandboxError> {
        let runtime = Runtime::new()?;
        if let Some(limit) = options.memory_limit_bytes {
            runtime.set_memory_limit(limit);
        }
        let context = Context::full(&runtime)?;
        Ok(Self {
            runtime,
            context,
            max_jobs: options.max_jobs_per_drain.max(1),
        })
    }

    pub fn set_loader<R, L>(&self, resolver: R, loader: L)
    where
        R: Resolver + 'static,
        L: Loader + 'static,
    {
        self.runtime.set_loader(resolver, loader);
    }

    /// Run `f` inside the context. A thrown exception is converted into
    /// [`SandboxError::Evaluation`] carrying its message and stack.
    pub fn with_context<T, F>(&self, f: F) -> Result<T, SandboxError>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        self.context.with(|ctx| match f(ctx.clone()) {
            Ok(value) => Ok(value),
            Err(JsError::Exception) => Err(SandboxError::Evaluation(capture_exception_message(
                &ctx,
            ))),
            Err(err) => Err(SandboxError::Engine(err)),
        })
    }

    /// Evaluate a classic script and convert its completion value.
    pub fn eval_script<V>(&self, source: &str, filename: &str) -> Result<V, SandboxError>
    where
        V: for<'js> FromJs<'js>,
    {
        let script = with_source_url(source, filename);
        let value = self.with_context(|ctx| ctx.eval::<V, _>(script))?;
        self.drain_jobs();
        Ok(value)
    }

    /// Evaluate `source` as an ES module. Imports go through the installed
    /// loader. A module still awaiting something after the drain is left
    /// running; a rejected evaluation is returned as an error.
    pub fn eval_module(&self, name: &str, source: &str) -> Result<(), SandboxError> {
        let promise = self.with_context(|ctx| {
            let promise = Module::evaluate(ctx.clone(), name, source)?;
            Ok(Persistent::save(&ctx, promise))
        })?;

        self.drain_jobs();

        self.with_context(|ctx| {
            let promise = promise.restore(&ctx)?;
            match promise.result::<Value>() {
                Some(result) => result.map(|_| ()),
                None => {
                    tracing::debug!(target: "quickjs", module = name, "module evaluation still pending");
                    Ok(())
                }
            }
        })
    }

    /// Run queued promise jobs until the queue is empty or the per-drain cap
    /// is hit. Failing jobs are logged and skipped. Returns the number of jobs
    /// executed.
    pub fn drain_jobs(&self) -> usize {
        let mut job_count = 0;
        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => job_count += 1,
                Ok(false) => break,
                Err(job_exception) => {
                    job_count += 1;
                    tracing::error!(target: "quickjs", "Job execution error: {:?}", job_exception);
                }
            }
            if job_count >= self.max_jobs {
                tracing::warn!(
                    target: "quickjs",
                    "Stopped processing jobs after {} iterations (possible infinite loop)",
                    self.max_jobs
                );
                break;
            }
        }

        if job_count > 0 {
            tracing::trace!(target: "quickjs", "Executed {} pending jobs", job_count);
        }
        job_count
    }

    pub fn run_gc(&self) {
        self.runtime.run_gc();
    }
}

fn with_source_url(source: &str, filename: &str) -> Vec<u8> {
    let mut script = String::with_capacity(source.len() + filename.len() + 32);
    script.push_str(source);
    if !source.ends_with('\n') {
        script.push('\n');
    }
    script.push_str("//# sourceURL=");
    script.push_str(filename);
    script.push('\n');
    script.into_bytes()
}

/// Take the pending exception off `ctx` and describe it.
pub fn capture_exception_message(ctx: &Ctx<'_>) -> String {
    let exception: Value = ctx.catch();

    if let Some(obj) = exception.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            let name = obj
                .get::<_, String>("name")
                .unwrap_or_else(|_| "Error".to_string());
            if let Ok(stack) = obj.get::<_, String>("stack") {
                if !stack.is_empty() {
                    return format!("{name}: {message}\n{stack}");
                }
            }
            return format!("{name}: {message}");
        }
    }

    if let Some(text) = exception.as_string().and_then(|s| s.to_string().ok()) {
        return text;
    }

    format!("{:?}", exception)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_completion_value() {
        let engine = QuickJsEngine::new().unwrap();
        let value: i32 = engine.eval_script("1 + 2", "sum.js").unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn thrown_errors_carry_message() {
        let engine = QuickJsEngine::new().unwrap();
        let err = engine
            .eval_script::<()>("throw new TypeError('nope')", "throw.js")
            .unwrap_err();
        match err {
            SandboxError::Evaluation(message) => assert!(message.starts_with("TypeError: nope")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn drains_promise_jobs() {
        let engine = QuickJsEngine::new().unwrap();
        engine
            .eval_script::<()>(
                "globalThis.done = false; Promise.resolve().then(() => { globalThis.done = true; });",
                "jobs.js",
            )
            .unwrap();
        let done: bool = engine.eval_script("globalThis.done", "check.js").unwrap();
        assert!(done);
    }

    #[test]
    fn module_rejection_is_an_error() {
        let engine = QuickJsEngine::new().unwrap();
        let err = engine
            .eval_module("broken", "throw new Error('module failed');")
            .unwrap_err();
        assert!(matches!(err, SandboxError::Evaluation(message) if message.contains("module failed")));
    }

    #[test]
    fn module_can_reach_globals() {
        let engine = QuickJsEngine::new().unwrap();
        engine
            .eval_module("main", "const value = await Promise.resolve(7); globalThis.out = value;")
            .unwrap();
        let out: i32 = engine.eval_script("globalThis.out", "out.js").unwrap();
        assert_eq!(out, 7);
    }
}
