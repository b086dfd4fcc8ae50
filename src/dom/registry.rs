use std::collections::BTreeMap;

use rquickjs::object::Property;
use rquickjs::{Ctx, Object, Value};

use super::host::HostNodeId;
use super::node::ElementKind;
use crate::error::BridgeError;
use crate::js::handle::SandboxHandle;

/// Hidden, read-only identity property carried by every tracked handle.
pub const NODE_ID_PROPERTY: &str = "__sandboxNodeId";

/// A host node paired with its interpreter-side handle.
#[derive(Debug)]
pub struct TrackedNode {
    pub id: u32,
    pub host: HostNodeId,
    pub kind: ElementKind,
    handle: SandboxHandle,
}

impl TrackedNode {
    pub fn new(id: u32, host: HostNodeId, kind: ElementKind, handle: SandboxHandle) -> Self {
        Self {
            id,
            host,
            kind,
            handle,
        }
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    /// A counted duplicate of the canonical handle for the caller.
    pub fn value<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        self.handle.value(ctx)
    }
}

/// Stamp the hidden identity property on a fresh node object.
pub fn stamp_identity(object: &Object<'_>, id: u32) -> rquickjs::Result<()> {
    object.prop(NODE_ID_PROPERTY, Property::from(id))
}

/// Reads the hidden identity property of a handle, if it has one.
pub fn handle_id(value: &Value<'_>) -> Option<u32> {
    value
        .as_object()
        .and_then(|object| object.get::<_, Option<u32>>(NODE_ID_PROPERTY).ok())
        .flatten()
}

/// The bridge's record of every node the sandbox can reach. Holds exactly one
/// canonical handle per tracked node; ids start at 1 and are never reused.
#[derive(Debug)]
pub struct NodeRegistry {
    next_id: u32,
    nodes: BTreeMap<u32, TrackedNode>,
    document: Option<u32>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            nodes: BTreeMap::new(),
            document: None,
        }
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Insert `node`. Re-adding an id already present keeps the existing entry
    /// and releases the incoming handle; a host node may only be tracked once.
    pub fn add(&mut self, node: TrackedNode) -> Result<&TrackedNode, BridgeError> {
        if self.nodes.contains_key(&node.id) {
            let id = node.id;
            node.handle.release();
            return self.nodes.get(&id).ok_or(BridgeError::UntrackedHandle(Some(id)));
        }
        if let Some(existing) = self.find_by_node(node.host) {
            return Err(BridgeError::DuplicateHostNode {
                host: node.host,
                existing: existing.id,
            });
        }
        let id = node.id;
        Ok(self.nodes.entry(id).or_insert(node))
    }

    pub fn find_by_node(&self, host: HostNodeId) -> Option<&TrackedNode> {
        self.nodes.values().find(|node| node.host == host)
    }

    pub fn find_by_id(&self, id: u32) -> Option<&TrackedNode> {
        self.nodes.get(&id)
    }

    /// Look a handle up by its identity property. The handle must be the very
    /// object the registry handed out, not a lookalike carrying the same id.
    pub fn find_by_handle<'js>(&self, ctx: &Ctx<'js>, value: &Value<'js>) -> Option<&TrackedNode> {
        let Some(id) = handle_id(value) else {
            tracing::warn!(target: "sandbox::bridge", "handle has no node identity");
            return None;
        };
        let Some(node) = self.nodes.get(&id) else {
            tracing::warn!(target: "sandbox::bridge", id, "stale or foreign node handle");
            return None;
        };
        match node.value(ctx) {
            Ok(canonical) if canonical == *value => Some(node),
            _ => {
                tracing::warn!(target: "sandbox::bridge", id, "handle does not match tracked node");
                None
            }
        }
    }

    /// Forget the node behind `value` and release its canonical handle.
    pub fn delete_by_handle<'js>(
        &mut self,
        ctx: &Ctx<'js>,
        value: &Value<'js>,
    ) -> Result<(u32, HostNodeId), BridgeError> {
        let id = self
            .find_by_handle(ctx, value)
            .map(|node| node.id)
            .ok_or(BridgeError::UntrackedHandle(handle_id(value)))?;
        self.delete_by_id(id)
    }

    pub fn delete_by_id(&mut self, id: u32) -> Result<(u32, HostNodeId), BridgeError> {
        let node = self
            .nodes
            .remove(&id)
            .ok_or(BridgeError::UntrackedHandle(Some(id)))?;
        let host = node.host;
        node.handle.release();
        if self.document == Some(id) {
            self.document = None;
        }
        Ok((id, host))
    }

    pub fn set_document(&mut self, id: u32) {
        self.document = Some(id);
    }

    pub fn document(&self) -> Option<&TrackedNode> {
        self.document.and_then(|id| self.nodes.get(&id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes.keys().copied()
    }

    /// Release every remaining handle. Returns how many were tracked.
    pub fn dispose(&mut self) -> usize {
        let nodes = std::mem::take(&mut self.nodes);
        let count = nodes.len();
        for node in nodes.into_values() {
            node.handle.release();
        }
        self.document = None;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::host::{HostDocument, Namespace};
    use crate::js::handle::HandleLedger;
    use crate::js::runtime::QuickJsEngine;

    fn tracked<'js>(
        ctx: &Ctx<'js>,
        registry: &mut NodeRegistry,
        host: HostNodeId,
        ledger: &HandleLedger,
    ) -> rquickjs::Result<(u32, Value<'js>)> {
        let id = registry.next_id();
        let object = Object::new(ctx.clone())?;
        stamp_identity(&object, id)?;
        let value = object.into_value();
        let handle = SandboxHandle::save(ctx, value.clone(), ledger);
        registry
            .add(TrackedNode::new(id, host, ElementKind::Element, handle))
            .map_err(|err| rquickjs::Error::new_from_js_message("node", "tracked", err.to_string()))?;
        Ok((id, value))
    }

    #[test]
    fn lookup_by_handle_and_node() {
        let engine = QuickJsEngine::new().unwrap();
        let ledger = HandleLedger::new();
        let mut document = HostDocument::new();
        let div = document.create_element("div", Namespace::Html);
        let mut registry = NodeRegistry::new();

        engine
            .with_context(|ctx| {
                let (id, value) = tracked(&ctx, &mut registry, div, &ledger)?;
                assert_eq!(id, 1);
                assert_eq!(registry.find_by_handle(&ctx, &value).map(|n| n.id), Some(1));
                assert_eq!(registry.find_by_node(div).map(|n| n.id), Some(1));

                let forged: Value = ctx.eval("({ __sandboxNodeId: 1 })")?;
                assert!(registry.find_by_handle(&ctx, &forged).is_none());

                let (removed, host) = registry.delete_by_handle(&ctx, &value).unwrap();
                assert_eq!((removed, host), (1, div));
                assert!(registry.find_by_handle(&ctx, &value).is_none());
                assert_eq!(
                    registry.delete_by_handle(&ctx, &value),
                    Err(BridgeError::UntrackedHandle(Some(1)))
                );
                Ok(())
            })
            .unwrap();

        assert_eq!(ledger.live(), 0);
    }

    #[test]
    fn ids_are_never_reused_and_hosts_are_unique() {
        let engine = QuickJsEngine::new().unwrap();
        let ledger = HandleLedger::new();
        let mut document = HostDocument::new();
        let a = document.create_element("div", Namespace::Html);
        let mut registry = NodeRegistry::new();

        engine
            .with_context(|ctx| {
                let (first, value) = tracked(&ctx, &mut registry, a, &ledger)?;
                registry.delete_by_handle(&ctx, &value).unwrap();
                let (second, _) = tracked(&ctx, &mut registry, a, &ledger)?;
                assert!(second > first);

                let id = registry.next_id();
                let object = Object::new(ctx.clone())?;
                let handle = SandboxHandle::save(&ctx, object.into_value(), &ledger);
                let err = registry
                    .add(TrackedNode::new(id, a, ElementKind::Element, handle))
                    .unwrap_err();
                assert_eq!(err, BridgeError::DuplicateHostNode { host: a, existing: second });
                Ok(())
            })
            .unwrap();

        assert_eq!(registry.dispose(), 1);
        assert!(registry.is_empty());
        assert_eq!(ledger.live(), 0);
    }
}
