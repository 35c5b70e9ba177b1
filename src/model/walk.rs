//! Depth-bounded recursive exploration of a source and everything derived
//! from it.

use super::dispatch::DerivedSourceTable;
use super::error::{ModelError, Result};
use super::handle::Handle;
use super::manager::SourceManager;
use super::source::Source;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_MAX_DEPTH: usize = 8;

/// What the walker found at one handle.
#[derive(Debug)]
pub enum Visit {
    /// An object with no derived source.
    Leaf(Handle),
    /// An object that was opened as a container; its children follow.
    Container(Handle),
    /// A container that could not be opened; treat it as a leaf.
    Degraded(Handle, ModelError),
    /// A container below the depth limit; treat it as a leaf.
    TooDeep(Handle),
    /// A handle (or an enumeration step) that failed outright.
    Problem(Option<Handle>, ModelError),
}

impl Visit {
    pub fn handle(&self) -> Option<&Handle> {
        match self {
            Visit::Leaf(h) | Visit::Container(h) | Visit::Degraded(h, _) | Visit::TooDeep(h) => {
                Some(h)
            }
            Visit::Problem(h, _) => h.as_ref(),
        }
    }

    /// Whether the handle should be processed as a single object.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Visit::Leaf(_) | Visit::Degraded(..) | Visit::TooDeep(_))
    }
}

#[derive(Debug, Clone)]
pub struct Walker {
    table: Arc<DerivedSourceTable>,
    max_depth: usize,
}

impl Walker {
    pub fn new(table: Arc<DerivedSourceTable>, max_depth: usize) -> Self {
        Self {
            table,
            max_depth: max_depth.max(1),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Walks `source`, reporting every handle to `visit` in the order the
    /// containers yield them, parents before children.
    ///
    /// Only failure to open `source` itself is returned as an error.
    pub fn walk(
        &self,
        source: &Arc<Source>,
        sm: &SourceManager,
        visit: &mut dyn FnMut(Visit),
    ) -> Result<()> {
        let handles = source.handles(sm)?;
        self.walk_handles(handles, sm, visit);
        Ok(())
    }

    /// Convenience for callers that want the whole report at once.
    pub fn collect(&self, source: &Arc<Source>, sm: &SourceManager) -> Result<Vec<Visit>> {
        let mut visits = Vec::new();
        self.walk(source, sm, &mut |v| visits.push(v))?;
        Ok(visits)
    }

    fn walk_handles(
        &self,
        handles: super::source::HandleIter,
        sm: &SourceManager,
        visit: &mut dyn FnMut(Visit),
    ) {
        for item in handles {
            match item {
                Ok(handle) => self.visit_handle(handle, sm, visit),
                Err(err) => {
                    warn!(error = %err, "Failed to enumerate handle");
                    visit(Visit::Problem(None, err));
                }
            }
        }
    }

    fn visit_handle(&self, handle: Handle, sm: &SourceManager, visit: &mut dyn FnMut(Visit)) {
        let derived = match self.table.derive(&handle, sm) {
            Ok(derived) => derived,
            Err(err) => {
                visit(Visit::Problem(Some(handle), err));
                return;
            }
        };

        let Some(source) = derived else {
            visit(Visit::Leaf(handle));
            return;
        };

        if source.depth() > self.max_depth {
            debug!(handle = %handle, max_depth = self.max_depth, "Depth limit reached");
            visit(Visit::TooDeep(handle));
            return;
        }

        let source = Arc::new(source);
        match source.handles(sm) {
            Ok(children) => {
                visit(Visit::Container(handle));
                self.walk_handles(children, sm, visit);
            }
            Err(err) if err.is_unexplorable() => {
                warn!(handle = %handle, error = %err, "Container could not be opened, treating as leaf");
                visit(Visit::Degraded(handle, err));
            }
            Err(err) => {
                warn!(handle = %handle, error = %err, "Container failed to open");
                visit(Visit::Problem(Some(handle), err));
            }
        }
    }
}

impl Default for Walker {
    fn default() -> Self {
        Self::new(Arc::new(DerivedSourceTable::with_defaults()), DEFAULT_MAX_DEPTH)
    }
}
