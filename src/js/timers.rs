use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Duration;

use futures_util::future::poll_fn;
use futures_util::task::AtomicWaker;
use rquickjs::function::{Opt, Rest};
use rquickjs::{Array, Ctx, Function, Value};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::handle::{HandleLedger, SandboxHandle};
use super::runtime::QuickJsEngine;
use crate::log::{ViolationKind, ViolationLog};

/// Longest delay a browser honours; larger values are clamped.
const MAX_DELAY_MS: f64 = 2_147_483_647.0;

const BIND_ARGUMENTS: &str =
    "((callback, args) => function () { return callback.apply(this, args); })";

/// Fold the arguments after the delay into the callback so the retained
/// handle stays a single function.
fn bind_arguments<'js>(
    ctx: &Ctx<'js>,
    callback: Value<'js>,
    args: Vec<Value<'js>>,
) -> rquickjs::Result<Value<'js>> {
    let array = Array::new(ctx.clone())?;
    for (index, arg) in args.into_iter().enumerate() {
        array.set(index, arg)?;
    }
    let bind: Function = ctx.eval(BIND_ARGUMENTS)?;
    bind.call((callback, array))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Timeout,
    Interval,
}

struct TimerEntry {
    kind: TimerKind,
    callback: SandboxHandle,
    task: JoinHandle<()>,
}

/// `setTimeout`/`setInterval` for one sandbox.
///
/// Host timers run as tokio tasks that only report their id. Callbacks are
/// invoked later from [`TimerBridge::run_due`], outside of any other call
/// into the interpreter, followed by a job drain.
pub struct TimerBridge {
    handle: Handle,
    ledger: HandleLedger,
    violations: ViolationLog,
    next_id: Cell<u32>,
    timers: RefCell<HashMap<u32, TimerEntry>>,
    ready: RefCell<VecDeque<u32>>,
    fired_rx: RefCell<UnboundedReceiver<u32>>,
    fired_tx: UnboundedSender<u32>,
    waker: Arc<AtomicWaker>,
    disposed: Cell<bool>,
}

impl TimerBridge {
    pub fn new(handle: Handle, ledger: HandleLedger, violations: ViolationLog) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            handle,
            ledger,
            violations,
            next_id: Cell::new(1),
            timers: RefCell::new(HashMap::new()),
            ready: RefCell::new(VecDeque::new()),
            fired_rx: RefCell::new(rx),
            fired_tx: tx,
            waker: Arc::new(AtomicWaker::new()),
            disposed: Cell::new(false),
        }
    }

    /// Define the four timer globals. The globals keep only a weak reference
    /// to the bridge.
    pub fn install<'js>(bridge: &Rc<Self>, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let global = ctx.globals();

        for (name, kind) in [
            ("setTimeout", TimerKind::Timeout),
            ("setInterval", TimerKind::Interval),
        ] {
            let weak = Rc::downgrade(bridge);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>,
                      callback: Opt<Value<'js>>,
                      delay: Opt<Value<'js>>,
                      args: Rest<Value<'js>>|
                      -> rquickjs::Result<u32> {
                    let Some(bridge) = weak.upgrade() else {
                        return Ok(0);
                    };
                    let delay = delay.0.and_then(|value| value.as_number()).unwrap_or(0.0);
                    let mut callback = callback.0.unwrap_or_else(|| Value::new_undefined(ctx.clone()));
                    if callback.is_function() && !args.0.is_empty() {
                        callback = bind_arguments(&ctx, callback, args.0)?;
                    }
                    Ok(bridge.schedule(&ctx, callback, delay, kind))
                },
            )?
            .with_name(name)?;
            global.set(name, func)?;
        }

        for name in ["clearTimeout", "clearInterval"] {
            let weak: Weak<Self> = Rc::downgrade(bridge);
            let func = Function::new(
                ctx.clone(),
                move |id: Opt<Value<'js>>| -> rquickjs::Result<()> {
                    let Some(bridge) = weak.upgrade() else {
                        return Ok(());
                    };
                    if let Some(id) = id.0.and_then(|value| value.as_number()) {
                        if id >= 1.0 && id <= u32::MAX as f64 {
                            bridge.clear(id as u32);
                        }
                    }
                    Ok(())
                },
            )?
            .with_name(name)?;
            global.set(name, func)?;
        }

        Ok(())
    }

    fn next_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1).max(1));
        id
    }

    fn schedule<'js>(&self, ctx: &Ctx<'js>, callback: Value<'js>, delay_ms: f64, kind: TimerKind) -> u32 {
        if self.disposed.get() {
            tracing::debug!(target: "sandbox::timers", "timer scheduled after teardown ignored");
            return 0;
        }
        if !callback.is_function() {
            self.violations.record(
                ViolationKind::Timer,
                format!("{kind:?} callback is not a function and was ignored"),
            );
            return 0;
        }

        let mut duration = if delay_ms.is_finite() && delay_ms > 0.0 {
            Duration::from_secs_f64(delay_ms.min(MAX_DELAY_MS) / 1_000.0)
        } else {
            Duration::ZERO
        };
        if kind == TimerKind::Interval && duration.is_zero() {
            duration = Duration::from_millis(1);
        }

        let id = self.next_id();
        let tx = self.fired_tx.clone();
        let waker = Arc::clone(&self.waker);
        let task = match kind {
            TimerKind::Interval => self.handle.spawn(async move {
                loop {
                    sleep(duration).await;
                    if tx.send(id).is_err() {
                        break;
                    }
                    waker.wake();
                }
            }),
            TimerKind::Timeout => self.handle.spawn(async move {
                sleep(duration).await;
                if tx.send(id).is_ok() {
                    waker.wake();
                }
            }),
        };

        let entry = TimerEntry {
            kind,
            callback: SandboxHandle::save(ctx, callback, &self.ledger),
            task,
        };
        self.timers.borrow_mut().insert(id, entry);
        tracing::trace!(target: "sandbox::timers", id, ?kind, ?duration, "timer scheduled");
        id
    }

    /// Cancel a timeout or interval. Unknown ids are ignored.
    pub fn clear(&self, id: u32) {
        let entry = self.timers.borrow_mut().remove(&id);
        if let Some(entry) = entry {
            entry.task.abort();
            entry.callback.release();
            tracing::trace!(target: "sandbox::timers", id, "timer cleared");
        }
    }

    pub fn register_waker(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    pub fn has_pending_timers(&self) -> bool {
        !self.timers.borrow().is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.timers.borrow().len()
    }

    fn poll_fired(&self, cx: &mut TaskContext<'_>) -> Poll<()> {
        if !self.ready.borrow().is_empty() {
            return Poll::Ready(());
        }
        self.waker.register(cx.waker());
        match self.fired_rx.borrow_mut().poll_recv(cx) {
            Poll::Ready(Some(id)) => {
                self.ready.borrow_mut().push_back(id);
                Poll::Ready(())
            }
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }

    /// Resolves once at least one host timer has fired.
    pub async fn fired(&self) {
        poll_fn(|cx| self.poll_fired(cx)).await
    }

    /// Invoke the callbacks of every timer that fired since the last call.
    /// Returns the number of callbacks run.
    pub fn run_due(&self, engine: &QuickJsEngine) -> usize {
        let mut fired: Vec<u32> = self.ready.borrow_mut().drain(..).collect();
        {
            let mut rx = self.fired_rx.borrow_mut();
            while let Ok(id) = rx.try_recv() {
                fired.push(id);
            }
        }

        let mut ran = 0;
        for id in fired {
            if self.disposed.get() {
                break;
            }

            let callback = {
                let mut timers = self.timers.borrow_mut();
                match timers.get(&id).map(|entry| entry.kind) {
                    Some(TimerKind::Timeout) => timers.remove(&id).map(|entry| entry.callback),
                    Some(TimerKind::Interval) => timers.get(&id).map(|entry| entry.callback.borrow()),
                    None => None,
                }
            };
            // Cleared between firing and now.
            let Some(callback) = callback else {
                continue;
            };

            let result = engine.with_context(|ctx| {
                let value = callback.value(&ctx)?;
                match value.as_function() {
                    Some(function) => function.call::<_, Value>(()).map(|_| ()),
                    None => Ok(()),
                }
            });
            callback.release();
            if let Err(err) = result {
                tracing::error!(target: "sandbox::timers", id, "timer callback failed: {err}");
            }
            engine.drain_jobs();
            ran += 1;
        }
        ran
    }

    /// Cancel every outstanding timer and release its callback. Later
    /// scheduling calls are ignored.
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let entries: Vec<TimerEntry> = self.timers.borrow_mut().drain().map(|(_, e)| e).collect();
        let cancelled = entries.len();
        for entry in entries {
            entry.task.abort();
            entry.callback.release();
        }
        self.ready.borrow_mut().clear();
        tracing::debug!(target: "sandbox::timers", cancelled, "timers disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}
