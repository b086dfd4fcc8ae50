use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// Newest violations kept per sandbox; older entries are dropped.
const MAX_RETAINED_VIOLATIONS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    Tag,
    Namespace,
    Attribute,
    InputType,
    Url,
    Css,
    Property,
    Marshal,
    Import,
    Timer,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ViolationKind::Tag => "tag",
            ViolationKind::Namespace => "namespace",
            ViolationKind::Attribute => "attribute",
            ViolationKind::InputType => "input-type",
            ViolationKind::Url => "url",
            ViolationKind::Css => "css",
            ViolationKind::Property => "property",
            ViolationKind::Marshal => "marshal",
            ViolationKind::Import => "import",
            ViolationKind::Timer => "timer",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub message: String,
}

/// Per-sandbox record of recoverable policy violations.
///
/// Every entry is also emitted through `tracing` at `warn` under the
/// `sandbox::violation` target. Cloning shares the same record.
#[derive(Clone, Default)]
pub struct ViolationLog {
    entries: Rc<RefCell<VecDeque<Violation>>>,
    total: Rc<Cell<usize>>,
}

impl ViolationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: ViolationKind, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(target: "sandbox::violation", kind = %kind, "{message}");

        let mut entries = self.entries.borrow_mut();
        if entries.len() == MAX_RETAINED_VIOLATIONS {
            entries.pop_front();
        }
        entries.push_back(Violation { kind, message });
        self.total.set(self.total.get() + 1);
    }

    /// Total number of violations recorded, including ones no longer retained.
    pub fn count(&self) -> usize {
        self.total.get()
    }

    pub fn count_of(&self, kind: ViolationKind) -> usize {
        self.entries
            .borrow()
            .iter()
            .filter(|violation| violation.kind == kind)
            .count()
    }

    pub fn snapshot(&self) -> Vec<Violation> {
        self.entries.borrow().iter().cloned().collect()
    }

    pub fn last(&self) -> Option<Violation> {
        self.entries.borrow().back().cloned()
    }
}

impl fmt::Debug for ViolationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViolationLog")
            .field("total", &self.count())
            .field("retained", &self.entries.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_newest_entries() {
        let log = ViolationLog::new();
        for index in 0..(MAX_RETAINED_VIOLATIONS + 4) {
            log.record(ViolationKind::Tag, format!("violation {index}"));
        }

        assert_eq!(log.count(), MAX_RETAINED_VIOLATIONS + 4);
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), MAX_RETAINED_VIOLATIONS);
        assert_eq!(snapshot[0].message, "violation 4");
    }

    #[test]
    fn clones_share_entries() {
        let log = ViolationLog::new();
        let other = log.clone();
        other.record(ViolationKind::Css, "bad url");
        assert_eq!(log.count_of(ViolationKind::Css), 1);
        assert_eq!(log.last().map(|v| v.kind), Some(ViolationKind::Css));
    }
}
