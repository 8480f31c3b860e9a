use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::items::{Item, ItemId};
use crate::Result;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerType(pub String);

impl ContainerType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContainerType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub name: String,
    #[serde(default)]
    pub research_prerequisites: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub products: Vec<ItemId>,
    #[serde(default = "available_by_default")]
    pub available: bool,
    #[serde(default)]
    pub facilities: Vec<Facility>,
}

fn available_by_default() -> bool {
    true
}

/// Read-only view of the host's definition database.
///
/// Items and recipes are owned by the host; implementations hand out
/// borrowed slices and must not create or destroy definitions.
pub trait HostRegistry {
    fn items(&self) -> &[Item];

    fn item(&self, id: &ItemId) -> Option<&Item> {
        self.items().iter().find(|item| &item.id == id)
    }

    fn recipes(&self) -> &[Recipe];

    /// `None` when the host has no research project by that name.
    fn research_finished(&self, research: &str) -> Option<bool>;

    fn container_types(&self) -> Vec<ContainerType>;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticRegistry {
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub recipes: Vec<Recipe>,
    #[serde(default)]
    pub finished_research: BTreeSet<String>,
    #[serde(default)]
    pub known_research: BTreeSet<String>,
    #[serde(default)]
    pub containers: Vec<ContainerType>,
}

impl StaticRegistry {
    pub fn from_json(src: &str) -> Result<Self> {
        Ok(serde_json::from_str(src)?)
    }

    pub fn finish_research(&mut self, research: &str) {
        self.known_research.insert(research.to_string());
        self.finished_research.insert(research.to_string());
    }

    pub fn set_recipe_available(&mut self, recipe: &str, available: bool) {
        if let Some(r) = self.recipes.iter_mut().find(|r| r.name == recipe) {
            r.available = available;
        }
    }
}

impl HostRegistry for StaticRegistry {
    fn items(&self) -> &[Item] {
        &self.items
    }

    fn recipes(&self) -> &[Recipe] {
        &self.recipes
    }

    fn research_finished(&self, research: &str) -> Option<bool> {
        if self.finished_research.contains(research) {
            Some(true)
        } else if self.known_research.contains(research) {
            Some(false)
        } else {
            None
        }
    }

    fn container_types(&self) -> Vec<ContainerType> {
        self.containers.clone()
    }
}
