use std::collections::BTreeMap;

use tracing::warn;

use crate::catalog::Catalog;
use crate::items::{Item, ItemId};
use crate::registry::ContainerType;
use crate::{DispenserError, Result};

/// Per container type default item.
///
/// Every entry points at an item that was eligible when it was last
/// validated; stale entries are removed rather than rewritten, so the type
/// falls back to the baseline item.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DefaultBindings {
    entries: BTreeMap<ContainerType, ItemId>,
    dirty: bool,
}

impl DefaultBindings {
    pub fn from_entries(entries: BTreeMap<ContainerType, ItemId>) -> Self {
        Self {
            entries,
            dirty: false,
        }
    }

    pub fn entries(&self) -> &BTreeMap<ContainerType, ItemId> {
        &self.entries
    }

    pub fn get(&self, container_type: &ContainerType) -> Option<&ItemId> {
        self.entries.get(container_type)
    }

    /// Whether a repair or edit happened since the last persist.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_persisted(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// The default for `container_type`, or the baseline item.
    ///
    /// A stale entry is dropped on the way and the store is marked dirty.
    pub fn get_default<'a>(
        &mut self,
        container_type: &ContainerType,
        catalog: &Catalog<'a>,
    ) -> Result<&'a Item> {
        if let Some(id) = self.entries.get(container_type) {
            if let Some(item) = catalog.eligible(id) {
                return Ok(item);
            }
            warn!(
                container = container_type.as_str(),
                item = id.as_str(),
                "default item no longer eligible; reverting to baseline"
            );
            self.entries.remove(container_type);
            self.dirty = true;
        }
        catalog.baseline()
    }

    pub fn set_default(
        &mut self,
        container_type: ContainerType,
        item: &ItemId,
        catalog: &Catalog<'_>,
    ) -> Result<()> {
        if !catalog.is_eligible(item) {
            return Err(DispenserError::Ineligible(item.clone()));
        }
        self.entries.insert(container_type, item.clone());
        self.dirty = true;
        Ok(())
    }

    pub fn clear_default(&mut self, container_type: &ContainerType) -> bool {
        let removed = self.entries.remove(container_type).is_some();
        self.dirty |= removed;
        removed
    }

    /// Drops every entry whose item is no longer eligible and returns the
    /// affected container types.
    pub fn validate(&mut self, catalog: &Catalog<'_>) -> Vec<ContainerType> {
        let stale: Vec<ContainerType> = self
            .entries
            .iter()
            .filter(|(_, id)| !catalog.is_eligible(id))
            .map(|(ty, _)| ty.clone())
            .collect();

        for ty in &stale {
            self.entries.remove(ty);
        }
        if !stale.is_empty() {
            self.dirty = true;
        }
        stale
    }
}
