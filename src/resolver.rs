use thiserror::Error;

use crate::models::{Dimension, DimensionKind};
use crate::storage::{StorageBackend, Upserted};

/// Ancestor-walk bound. Real hierarchies are a handful of levels deep;
/// anything past this indicates corrupt parent links.
const MAX_ANCESTRY_DEPTH: usize = 32;

/// A dimension as a source row describes it: by kind and source identifier,
/// with the parent named the same way rather than by row id.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionSpec {
    pub kind: DimensionKind,
    pub identifier: String,
    /// `None` makes this a reference-only lookup: the dimension must already
    /// exist and is never created or renamed (used by totals rows, which tag
    /// expenses with chapters defined by earlier law imports).
    pub name: Option<String>,
    pub parent: Option<(DimensionKind, String)>,
}

impl DimensionSpec {
    pub fn new(kind: DimensionKind, identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            name: Some(name.into()),
            parent: None,
        }
    }

    pub fn reference(kind: DimensionKind, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            name: None,
            parent: None,
        }
    }

    pub fn with_parent(mut self, kind: DimensionKind, identifier: impl Into<String>) -> Self {
        self.parent = Some((kind, identifier.into()));
        self
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("dimension {kind}:{identifier} does not exist")]
    NotFound { kind: DimensionKind, identifier: String },
    #[error("parent dimension {kind}:{identifier} does not exist (import parents before children)")]
    ParentNotFound { kind: DimensionKind, identifier: String },
    #[error("dimension {child_kind}:{identifier} cannot be parented by its own kind {parent_kind}")]
    ParentKindConflict {
        child_kind: DimensionKind,
        parent_kind: DimensionKind,
        identifier: String,
    },
    #[error("setting parent {parent_kind}:{parent_identifier} on {kind}:{identifier} would close a cycle")]
    CyclicParent {
        kind: DimensionKind,
        identifier: String,
        parent_kind: DimensionKind,
        parent_identifier: String,
    },
    #[error("ancestor chain of {kind}:{identifier} exceeds {MAX_ANCESTRY_DEPTH} levels")]
    AncestryTooDeep { kind: DimensionKind, identifier: String },
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

/// Find-or-create for dimension nodes.
///
/// Resolution is idempotent: feeding the same spec twice yields the same row
/// and the second pass reports `Unchanged`. Parents must exist before their
/// children are resolved, and a parent is never of the same kind as the
/// child, which together keep the hierarchy a forest.
pub struct DimensionResolver<'a> {
    store: &'a dyn StorageBackend,
}

impl<'a> DimensionResolver<'a> {
    pub fn new(store: &'a dyn StorageBackend) -> Self {
        Self { store }
    }

    pub fn resolve(&self, spec: &DimensionSpec) -> Result<(Dimension, Upserted), ResolveError> {
        let parent_id = match &spec.parent {
            Some((parent_kind, parent_identifier)) => {
                if parent_kind == &spec.kind {
                    return Err(ResolveError::ParentKindConflict {
                        child_kind: spec.kind.clone(),
                        parent_kind: parent_kind.clone(),
                        identifier: spec.identifier.clone(),
                    });
                }
                let parent = self
                    .store
                    .find_dimension(parent_kind, parent_identifier)?
                    .ok_or_else(|| ResolveError::ParentNotFound {
                        kind: parent_kind.clone(),
                        identifier: parent_identifier.clone(),
                    })?;
                Some(parent.id)
            }
            None => None,
        };

        let name = match &spec.name {
            Some(name) => name,
            None => {
                // Reference-only: never create, never rewrite.
                let dim = self
                    .store
                    .find_dimension(&spec.kind, &spec.identifier)?
                    .ok_or_else(|| ResolveError::NotFound {
                        kind: spec.kind.clone(),
                        identifier: spec.identifier.clone(),
                    })?;
                return Ok((dim, Upserted::Unchanged));
            }
        };

        if let (Some(parent_id), Some(existing)) = (
            parent_id,
            self.store.find_dimension(&spec.kind, &spec.identifier)?,
        ) {
            self.check_acyclic(&existing, parent_id, spec)?;
        }

        let (id, outcome) = self.store.upsert_dimension(
            &crate::models::write::DimensionUpsert {
                kind: spec.kind.clone(),
                original_identifier: spec.identifier.clone(),
                name: name.clone(),
                name_translated: None,
                parent_id,
            },
        )?;
        let dim = self.store.get_dimension(id)?;
        if outcome == Upserted::Created {
            tracing::debug!(kind = %dim.kind, identifier = %dim.original_identifier, "dimension created");
        }
        Ok((dim, outcome))
    }

    /// Walks up from `parent_id`; hitting `child` means the new link would
    /// close a cycle.
    fn check_acyclic(
        &self,
        child: &Dimension,
        parent_id: i64,
        spec: &DimensionSpec,
    ) -> Result<(), ResolveError> {
        let mut cursor = Some(parent_id);
        for _ in 0..MAX_ANCESTRY_DEPTH {
            let id = match cursor {
                Some(id) => id,
                None => return Ok(()),
            };
            if id == child.id {
                let (parent_kind, parent_identifier) =
                    spec.parent.clone().unwrap_or((spec.kind.clone(), String::new()));
                return Err(ResolveError::CyclicParent {
                    kind: spec.kind.clone(),
                    identifier: spec.identifier.clone(),
                    parent_kind,
                    parent_identifier,
                });
            }
            cursor = self.store.get_dimension(id)?.parent_id;
        }
        Err(ResolveError::AncestryTooDeep {
            kind: spec.kind.clone(),
            identifier: spec.identifier.clone(),
        })
    }
}
