use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DispenserError, Result};

pub const BASELINE_ITEM: &str = "MealNutrientPaste";

pub const BASE_UNIT: f32 = 0.6;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn baseline() -> Self {
        Self(BASELINE_ITEM.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_baseline(&self) -> bool {
        self.0 == BASELINE_ITEM
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

// Host tiers, worst first.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preferability {
    #[default]
    Undefined,
    Desperate,
    Raw,
    Awful,
    Simple,
    Fine,
    Lavish,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub label: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub potency: Option<f32>,
    #[serde(default)]
    pub preferability: Preferability,
    #[serde(default)]
    pub ingestible: bool,
    #[serde(default)]
    pub composed: bool,
}

impl Item {
    pub fn is_baseline(&self) -> bool {
        self.id.is_baseline()
    }
}

pub fn quantity_multiplier(item: &Item) -> Result<u32> {
    let potency = match item.potency {
        Some(p) if p.is_finite() && p > 0.0 => p,
        other => {
            return Err(DispenserError::InvalidItem {
                id: item.id.clone(),
                potency: other,
            })
        }
    };

    let scaled = (BASE_UNIT / potency).round_ties_even();
    if scaled > u32::MAX as f32 {
        return Err(DispenserError::InvalidItem {
            id: item.id.clone(),
            potency: Some(potency),
        });
    }
    Ok(scaled as u32)
}
