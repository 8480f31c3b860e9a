use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::defaults::DefaultBindings;
use crate::items::ItemId;
use crate::registry::{ContainerType, HostRegistry};
use crate::Result;

/// Research that unlocks items above simple fare.
pub const DEFAULT_GATING_RESEARCH: &str = "FoodSynthesis";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EligibilityRules {
    pub exclusions: BTreeSet<ItemId>,
    pub gating_research: Option<String>,
}

impl Default for EligibilityRules {
    fn default() -> Self {
        Self {
            exclusions: BTreeSet::new(),
            gating_research: Some(DEFAULT_GATING_RESEARCH.to_string()),
        }
    }
}

impl EligibilityRules {
    pub fn is_excluded(&self, id: &ItemId) -> bool {
        self.exclusions.contains(id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SettingsRecord {
    pub forbidden_meals: Vec<String>,
    pub default_meal: BTreeMap<String, String>,
    pub gating_research: Option<String>,
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self {
            forbidden_meals: Vec::new(),
            default_meal: BTreeMap::new(),
            gating_research: Some(DEFAULT_GATING_RESEARCH.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    pub rules: EligibilityRules,
    pub defaults: DefaultBindings,
}

impl Settings {
    /// Rebuilds settings from a stored record and runs one validation pass
    /// so stale defaults never survive a reload.
    pub fn from_record(record: SettingsRecord, registry: &dyn HostRegistry) -> Self {
        let exclusions = record
            .forbidden_meals
            .into_iter()
            .map(ItemId::new)
            .filter(|id| !id.is_baseline())
            .collect();
        let rules = EligibilityRules {
            exclusions,
            gating_research: record.gating_research,
        };
        let entries = record
            .default_meal
            .into_iter()
            .map(|(ty, id)| (ContainerType::new(ty), ItemId::new(id)))
            .collect();

        let mut settings = Self {
            rules,
            defaults: DefaultBindings::from_entries(entries),
        };
        let pruned = settings.validate(registry);
        if !pruned.is_empty() {
            warn!(count = pruned.len(), "dropped stale default items while loading settings");
        }
        settings
    }

    pub fn to_record(&self) -> SettingsRecord {
        SettingsRecord {
            forbidden_meals: self
                .rules
                .exclusions
                .iter()
                .map(|id| id.to_string())
                .collect(),
            default_meal: self
                .defaults
                .entries()
                .iter()
                .map(|(ty, id)| (ty.as_str().to_string(), id.to_string()))
                .collect(),
            gating_research: self.rules.gating_research.clone(),
        }
    }

    pub fn from_json(src: &str, registry: &dyn HostRegistry) -> Result<Self> {
        let record: SettingsRecord = serde_json::from_str(src)?;
        Ok(Self::from_record(record, registry))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_record())?)
    }

    pub fn validate(&mut self, registry: &dyn HostRegistry) -> Vec<ContainerType> {
        let catalog = Catalog::new(registry, &self.rules);
        self.defaults.validate(&catalog)
    }

    /// Flips the exclusion state of `id`. Returns whether the item is
    /// excluded afterwards; the baseline item is never excluded.
    pub fn toggle_excluded(&mut self, id: &ItemId, registry: &dyn HostRegistry) -> bool {
        if id.is_baseline() {
            return false;
        }
        let excluded = if self.rules.exclusions.remove(id) {
            false
        } else {
            self.rules.exclusions.insert(id.clone());
            true
        };
        self.validate(registry);
        self.defaults.mark_dirty();
        excluded
    }

    pub fn reset_exclusions(&mut self) {
        if !self.rules.exclusions.is_empty() {
            self.rules.exclusions.clear();
            self.defaults.mark_dirty();
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.defaults.is_dirty()
    }

    /// Hands the current record to `sink` if anything changed.
    pub fn flush(&mut self, sink: &mut dyn SettingsSink) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        sink.persist(&self.to_record())?;
        self.defaults.mark_persisted();
        Ok(())
    }
}

pub trait SettingsSink {
    fn persist(&mut self, record: &SettingsRecord) -> Result<()>;
}

/// Pretty-printed JSON file, created along with its parent directories.
#[derive(Clone, Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
}

impl JsonFileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means a fresh install.
    pub fn load(&self) -> Result<SettingsRecord> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no settings file; using defaults");
            return Ok(SettingsRecord::default());
        }
        let data = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

impl SettingsSink for JsonFileSettings {
    fn persist(&mut self, record: &SettingsRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(record)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::{Item, Preferability};
    use crate::registry::{Facility, Recipe, StaticRegistry};

    #[derive(Default)]
    struct MemorySink(Vec<SettingsRecord>);

    impl SettingsSink for MemorySink {
        fn persist(&mut self, record: &SettingsRecord) -> Result<()> {
            self.0.push(record.clone());
            Ok(())
        }
    }

    fn registry() -> StaticRegistry {
        let meal = |id: &str| Item {
            id: ItemId::new(id),
            label: id.to_lowercase(),
            icon: String::new(),
            potency: Some(0.9),
            preferability: Preferability::Simple,
            ingestible: true,
            composed: true,
        };
        StaticRegistry {
            items: vec![meal("MealNutrientPaste"), meal("MealSimple"), meal("MealSurvivalPack")],
            recipes: vec![Recipe {
                name: "CookMealSimple".to_string(),
                products: vec![ItemId::new("MealSimple"), ItemId::new("MealSurvivalPack")],
                available: true,
                facilities: vec![Facility {
                    name: "FueledStove".to_string(),
                    research_prerequisites: Vec::new(),
                }],
            }],
            containers: vec![ContainerType::new("NutrientPasteDispenser")],
            ..StaticRegistry::default()
        }
    }

    #[test]
    fn record_uses_stored_key_names() {
        let json = r#"{
            "forbiddenMeals": ["MealSurvivalPack"],
            "defaultMeal": { "NutrientPasteDispenser": "MealSimple" }
        }"#;
        let settings = Settings::from_json(json, &registry()).unwrap();
        assert!(settings.rules.is_excluded(&ItemId::new("MealSurvivalPack")));
        assert_eq!(
            settings.rules.gating_research.as_deref(),
            Some(DEFAULT_GATING_RESEARCH)
        );
        assert_eq!(
            settings.defaults.get(&ContainerType::new("NutrientPasteDispenser")),
            Some(&ItemId::new("MealSimple"))
        );
    }

    #[test]
    fn reload_keeps_mapping_and_drops_ineligible_entries() {
        let registry = registry();
        let mut settings = Settings::default();
        {
            let catalog = Catalog::new(&registry, &settings.rules);
            settings
                .defaults
                .set_default(
                    ContainerType::new("NutrientPasteDispenser"),
                    &ItemId::new("MealSimple"),
                    &catalog,
                )
                .unwrap();
            settings
                .defaults
                .set_default(
                    ContainerType::new("PasteTap"),
                    &ItemId::new("MealSurvivalPack"),
                    &catalog,
                )
                .unwrap();
        }

        let reloaded = Settings::from_json(&settings.to_json().unwrap(), &registry).unwrap();
        assert_eq!(reloaded.to_record(), settings.to_record());

        // Exclude one of the bound items behind the store's back, as an
        // edited settings file would.
        let mut record = settings.to_record();
        record.forbidden_meals.push("MealSurvivalPack".to_string());
        let json = serde_json::to_string(&record).unwrap();
        let reloaded = Settings::from_json(&json, &registry).unwrap();
        assert_eq!(reloaded.defaults.entries().len(), 1);
        assert!(reloaded
            .defaults
            .get(&ContainerType::new("PasteTap"))
            .is_none());
    }

    #[test]
    fn toggling_exclusion_prunes_defaults() {
        let registry = registry();
        let mut settings = Settings::default();
        {
            let catalog = Catalog::new(&registry, &settings.rules);
            settings
                .defaults
                .set_default(
                    ContainerType::new("NutrientPasteDispenser"),
                    &ItemId::new("MealSimple"),
                    &catalog,
                )
                .unwrap();
        }

        assert!(settings.toggle_excluded(&ItemId::new("MealSimple"), &registry));
        assert!(settings.defaults.entries().is_empty());
        assert!(!settings.toggle_excluded(&ItemId::new("MealSimple"), &registry));
        assert!(!settings.rules.is_excluded(&ItemId::new("MealSimple")));
    }

    #[test]
    fn baseline_cannot_be_excluded() {
        let registry = registry();
        let mut settings = Settings::default();
        assert!(!settings.toggle_excluded(&ItemId::baseline(), &registry));
        assert!(settings.rules.exclusions.is_empty());

        let record = SettingsRecord {
            forbidden_meals: vec!["MealNutrientPaste".to_string()],
            ..SettingsRecord::default()
        };
        let loaded = Settings::from_record(record, &registry);
        assert!(loaded.rules.exclusions.is_empty());
        assert_eq!(
            loaded.rules.gating_research.as_deref(),
            Some(DEFAULT_GATING_RESEARCH)
        );
    }

    #[test]
    fn every_default_record_keeps_research_gate() {
        let empty: SettingsRecord = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, SettingsRecord::default());
        assert_eq!(Settings::default().to_record(), SettingsRecord::default());

        let file = JsonFileSettings::new(std::env::temp_dir().join(format!(
            "dispenser-absent-{}.json",
            std::process::id()
        )));
        let loaded = file.load().unwrap();
        assert_eq!(loaded, SettingsRecord::default());
        assert_eq!(loaded.gating_research.as_deref(), Some(DEFAULT_GATING_RESEARCH));
    }

    #[test]
    fn flush_only_persists_changes() {
        let registry = registry();
        let mut settings = Settings::default();
        let mut sink = MemorySink::default();

        settings.flush(&mut sink).unwrap();
        assert!(sink.0.is_empty());

        settings.toggle_excluded(&ItemId::new("MealSurvivalPack"), &registry);
        settings.flush(&mut sink).unwrap();
        settings.flush(&mut sink).unwrap();
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].forbidden_meals, vec!["MealSurvivalPack".to_string()]);
    }

    #[test]
    fn reset_clears_exclusions() {
        let registry = registry();
        let mut settings = Settings::default();
        settings.toggle_excluded(&ItemId::new("MealSimple"), &registry);
        settings.reset_exclusions();
        assert!(settings.rules.exclusions.is_empty());
        assert!(settings.is_dirty());
    }
}
