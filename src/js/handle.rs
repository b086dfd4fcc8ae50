//! Owned references to values living inside the interpreter.
//!
//! A [`SandboxHandle`] keeps one counted reference to an interpreter value
//! alive outside of any `Ctx` scope. It cannot be cloned implicitly: a second
//! owner must ask for one with [`SandboxHandle::borrow`], and every owner gives
//! its reference back exactly once, either through [`SandboxHandle::release`]
//! or by dropping it. All handles must be gone before the runtime is dropped.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use rquickjs::{Ctx, Persistent, Value};

/// Counts live handles for one sandbox.
#[derive(Clone, Default)]
pub struct HandleLedger(Rc<Cell<usize>>);

impl HandleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&self) -> usize {
        self.0.get()
    }

    fn acquire(&self) {
        self.0.set(self.0.get() + 1);
    }

    fn give_back(&self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

impl fmt::Debug for HandleLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandleLedger").field(&self.live()).finish()
    }
}

pub struct SandboxHandle {
    value: Persistent<Value<'static>>,
    ledger: HandleLedger,
}

impl SandboxHandle {
    pub fn save<'js>(ctx: &Ctx<'js>, value: Value<'js>, ledger: &HandleLedger) -> Self {
        ledger.acquire();
        Self {
            value: Persistent::save(ctx, value),
            ledger: ledger.clone(),
        }
    }

    /// A second counted reference to the same value.
    pub fn borrow(&self) -> Self {
        self.ledger.acquire();
        Self {
            value: self.value.clone(),
            ledger: self.ledger.clone(),
        }
    }

    /// A fresh interpreter reference, valid for the `ctx` scope. Fails when
    /// `ctx` belongs to a different runtime.
    pub fn value<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        self.value.clone().restore(ctx)
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.ledger.give_back();
    }
}

impl fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::js::runtime::QuickJsEngine;

    #[test]
    fn ledger_tracks_borrows_and_releases() {
        let engine = QuickJsEngine::new().unwrap();
        let ledger = HandleLedger::new();

        let handles = engine
            .with_context(|ctx| {
                let value: Value = ctx.eval("({ answer: 42 })")?;
                let first = SandboxHandle::save(&ctx, value, &ledger);
                let second = first.borrow();
                Ok((first, second))
            })
            .unwrap();
        assert_eq!(ledger.live(), 2);

        let (first, second) = handles;
        first.release();
        assert_eq!(ledger.live(), 1);

        let answer = engine
            .with_context(|ctx| {
                let value = second.value(&ctx)?;
                value.into_object().unwrap().get::<_, i32>("answer")
            })
            .unwrap();
        assert_eq!(answer, 42);

        drop(second);
        assert_eq!(ledger.live(), 0);
    }
}
