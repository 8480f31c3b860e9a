use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use tracing::warn;

use crate::catalog::Catalog;
use crate::defaults::DefaultBindings;
use crate::items::{quantity_multiplier, Item, ItemId};
use crate::registry::ContainerType;
use crate::{DispenserError, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: ContainerId,
    pub container_type: ContainerType,
    pub has_storage: bool,
}

impl ContainerHandle {
    pub fn new(id: u64, container_type: impl Into<String>, has_storage: bool) -> Self {
        Self {
            id: ContainerId(id),
            container_type: ContainerType::new(container_type),
            has_storage,
        }
    }
}

/// Which items a storage container will take in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AcceptanceFilter {
    allowed: BTreeSet<ItemId>,
}

impl AcceptanceFilter {
    pub fn disallow_all(&mut self) {
        self.allowed.clear();
    }

    pub fn set_allowed(&mut self, id: &ItemId, allowed: bool) {
        if allowed {
            self.allowed.insert(id.clone());
        } else {
            self.allowed.remove(id);
        }
    }

    pub fn accepts(&self, id: &ItemId) -> bool {
        self.allowed.contains(id)
    }

    pub fn accepted(&self) -> impl Iterator<Item = &ItemId> {
        self.allowed.iter()
    }

    pub fn accept_only(&mut self, id: &ItemId) {
        self.disallow_all();
        self.set_allowed(id, true);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResolutionSource {
    Explicit,
    TypeDefault,
    Baseline,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub item: Item,
    pub multiplier: u32,
    pub source: ResolutionSource,
}

/// Save record stored inside the container's own save data.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    #[serde(default)]
    pub meal: Option<ItemId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectorOption {
    pub id: ItemId,
    pub label: String,
    pub icon: String,
}

/// Button shown on a container: the bound item's label and icon, opening a
/// menu of everything currently selectable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectorCommand {
    pub label: String,
    pub icon: String,
    pub options: Vec<SelectorOption>,
}

impl SelectorCommand {
    pub fn new(current: &Item, catalog: &Catalog<'_>) -> Self {
        Self {
            label: current.label.clone(),
            icon: current.icon.clone(),
            options: catalog
                .eligible_items()
                .into_iter()
                .map(|item| SelectorOption {
                    id: item.id.clone(),
                    label: item.label.clone(),
                    icon: item.icon.clone(),
                })
                .collect(),
        }
    }
}

/// The item bound to one container instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerBinding {
    container_type: ContainerType,
    chosen: Option<ItemId>,
    storage: Option<AcceptanceFilter>,
}

impl ContainerBinding {
    pub fn new(container_type: ContainerType, has_storage: bool) -> Self {
        Self {
            container_type,
            chosen: None,
            storage: has_storage.then(AcceptanceFilter::default),
        }
    }

    /// Restores a binding from its save record, forgetting a choice that is
    /// no longer eligible.
    pub fn from_record(
        container_type: ContainerType,
        has_storage: bool,
        record: ContainerRecord,
        catalog: &Catalog<'_>,
    ) -> Self {
        let mut binding = Self::new(container_type, has_storage);
        binding.chosen = record.meal.filter(|id| catalog.is_eligible(id));
        binding
    }

    pub fn to_record(&self) -> ContainerRecord {
        ContainerRecord {
            meal: self.chosen.clone(),
        }
    }

    pub fn chosen(&self) -> Option<&ItemId> {
        self.chosen.as_ref()
    }

    pub fn storage(&self) -> Option<&AcceptanceFilter> {
        self.storage.as_ref()
    }

    /// Explicit choice, then the type default, then the baseline item.
    ///
    /// Does not touch the storage filter. A stale explicit choice is cleared,
    /// so repeated calls return the same answer. An item whose multiplier
    /// cannot be computed resolves to the baseline instead.
    pub fn resolve(
        &mut self,
        catalog: &Catalog<'_>,
        defaults: &mut DefaultBindings,
    ) -> Result<Resolution> {
        let explicit = match &self.chosen {
            Some(id) => {
                let item = catalog.eligible(id);
                if item.is_none() {
                    warn!(
                        container = self.container_type.as_str(),
                        item = id.as_str(),
                        "chosen item no longer eligible; falling back"
                    );
                }
                item
            }
            None => None,
        };
        if explicit.is_none() {
            self.chosen = None;
        }

        let (item, source) = match explicit {
            Some(item) => (item, ResolutionSource::Explicit),
            None => {
                let item = defaults.get_default(&self.container_type, catalog)?;
                let source = if item.is_baseline() {
                    ResolutionSource::Baseline
                } else {
                    ResolutionSource::TypeDefault
                };
                (item, source)
            }
        };

        match quantity_multiplier(item) {
            Ok(multiplier) => Ok(Resolution {
                item: item.clone(),
                multiplier,
                source,
            }),
            Err(err) if !item.is_baseline() => {
                warn!(%err, "falling back to the baseline item");
                let baseline = catalog.baseline()?;
                Ok(Resolution {
                    item: baseline.clone(),
                    multiplier: quantity_multiplier(baseline)?,
                    source: ResolutionSource::Baseline,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Narrows the storage filter, if any, to exactly `item`.
    pub fn apply_filter(&mut self, item: &ItemId) {
        if let Some(filter) = self.storage.as_mut() {
            filter.accept_only(item);
        }
    }

    /// Binds `item` to this container and narrows its storage filter.
    /// Ineligible items are rejected and the previous choice stays.
    pub fn set_choice(&mut self, item: &ItemId, catalog: &Catalog<'_>) -> Result<()> {
        if !catalog.is_eligible(item) {
            return Err(DispenserError::Ineligible(item.clone()));
        }
        self.chosen = Some(item.clone());
        self.apply_filter(item);
        Ok(())
    }
}
