use crate::items::{Item, ItemId, Preferability};
use crate::registry::{HostRegistry, Recipe};
use crate::settings::EligibilityRules;
use crate::{DispenserError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct ListingEntry<'a> {
    pub item: &'a Item,
    pub excluded: bool,
    /// The baseline item can never be excluded.
    pub locked: bool,
}

/// Live view over the host registry filtered by the operator's rules.
///
/// Nothing is cached: research and recipe availability change while the
/// host runs, so every query walks the registry again.
pub struct Catalog<'a> {
    registry: &'a dyn HostRegistry,
    rules: &'a EligibilityRules,
}

impl<'a> Catalog<'a> {
    pub fn new(registry: &'a dyn HostRegistry, rules: &'a EligibilityRules) -> Self {
        Self { registry, rules }
    }

    pub fn composed_items(&self) -> impl Iterator<Item = &'a Item> + 'a {
        self.registry.items().iter().filter(|item| item.composed)
    }

    pub fn baseline(&self) -> Result<&'a Item> {
        self.registry
            .item(&ItemId::baseline())
            .ok_or(DispenserError::MissingBaseline)
    }

    pub fn eligible_items(&self) -> Vec<&'a Item> {
        self.composed_items()
            .filter(|item| self.admits(item))
            .collect()
    }

    pub fn eligible(&self, id: &ItemId) -> Option<&'a Item> {
        self.registry
            .item(id)
            .filter(|item| item.composed && self.admits(item))
    }

    pub fn is_eligible(&self, id: &ItemId) -> bool {
        self.eligible(id).is_some()
    }

    /// The baseline always is. Anything else needs an available recipe whose
    /// facilities all have their prerequisites finished.
    pub fn is_producible(&self, item: &Item) -> bool {
        item.is_baseline()
            || self
                .registry
                .recipes()
                .iter()
                .any(|recipe| recipe.products.contains(&item.id) && self.recipe_usable(recipe))
    }

    /// Items above simple fare stay locked until the gating research is done.
    pub fn passes_research_gate(&self, item: &Item) -> bool {
        if item.preferability <= Preferability::Simple {
            return true;
        }
        match self.rules.gating_research.as_deref() {
            Some(research) => self.registry.research_finished(research).unwrap_or(true),
            None => true,
        }
    }

    /// Every composed item with its exclusion state, selectable ones first.
    pub fn exclusion_listing(&self) -> Vec<ListingEntry<'a>> {
        let (mut allowed, excluded): (Vec<_>, Vec<_>) = self
            .composed_items()
            .map(|item| ListingEntry {
                item,
                excluded: self.rules.is_excluded(&item.id),
                locked: item.is_baseline(),
            })
            .partition(|entry| !entry.excluded);
        allowed.extend(excluded);
        allowed
    }

    fn admits(&self, item: &Item) -> bool {
        !self.rules.is_excluded(&item.id)
            && self.is_producible(item)
            && self.passes_research_gate(item)
    }

    fn recipe_usable(&self, recipe: &Recipe) -> bool {
        recipe.available
            && recipe.facilities.iter().all(|facility| {
                facility
                    .research_prerequisites
                    .iter()
                    .all(|research| self.registry.research_finished(research) == Some(true))
            })
    }
}
