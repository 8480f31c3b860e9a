use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, warn};

pub mod binding;
pub mod catalog;
pub mod defaults;
pub mod items;
pub mod patch;
pub mod registry;
pub mod rewrite;
pub mod settings;

pub use binding::{
    AcceptanceFilter, ContainerBinding, ContainerHandle, ContainerId, ContainerRecord, Resolution,
    ResolutionSource, SelectorCommand, SelectorOption,
};
pub use catalog::{Catalog, ListingEntry};
pub use defaults::DefaultBindings;
pub use items::{quantity_multiplier, Item, ItemId, Preferability, BASELINE_ITEM, BASE_UNIT};
pub use patch::{
    HostVersion, MemoryHost, MethodHost, PatchInstaller, PatchOutcome, PatchReport, PatchStatus,
    PatchTable, PatchTarget, RuleShape,
};
pub use registry::{ContainerType, Facility, HostRegistry, Recipe, StaticRegistry};
pub use rewrite::listing::ListingError;
pub use rewrite::RuleKind;
pub use settings::{EligibilityRules, JsonFileSettings, Settings, SettingsRecord, SettingsSink};

#[derive(Debug, Error)]
pub enum DispenserError {
    #[error("item {id} has no usable potency ({potency:?})")]
    InvalidItem { id: ItemId, potency: Option<f32> },
    #[error("item {0} is not currently eligible")]
    Ineligible(ItemId),
    #[error("unknown item {0}")]
    UnknownItem(ItemId),
    #[error("host registry has no {} item", BASELINE_ITEM)]
    MissingBaseline,
    #[error("{method} already patched with {kind}")]
    AlreadyPatched { method: String, kind: RuleKind },
    #[error("{0} cannot take its container from the stack")]
    StackSourceUnsupported(RuleKind),
    #[error("unrecognised host version '{0}'")]
    UnknownHostVersion(String),
    #[error("listing error: {0}")]
    Listing(#[from] ListingError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DispenserError>;

/// Run-time contract the rewritten host methods call through.
pub trait BindingLookup {
    fn resolved_item(&mut self, container: &ContainerHandle) -> Result<Item>;

    fn stack_multiplier(&mut self, container: &ContainerHandle) -> Result<u32>;
}

#[derive(Copy, Clone, Debug)]
pub enum ReportTarget<'a> {
    Container(&'a ContainerHandle),
    Item(&'a ItemId),
}

/// Owns the host registry view, the operator settings and every live
/// container binding.
pub struct Dispenser<R: HostRegistry> {
    registry: R,
    settings: Settings,
    containers: BTreeMap<ContainerId, ContainerBinding>,
    sink: Option<Box<dyn SettingsSink>>,
}

impl<R: HostRegistry> Dispenser<R> {
    /// Every resolution chain ends at the baseline item, so the registry
    /// must carry it with a usable potency.
    pub fn new(registry: R, mut settings: Settings) -> Result<Self> {
        let baseline = Catalog::new(&registry, &settings.rules).baseline()?;
        quantity_multiplier(baseline)?;
        let pruned = settings.validate(&registry);
        if !pruned.is_empty() {
            warn!(count = pruned.len(), "dropped stale default items");
        }
        Ok(Self {
            registry,
            settings,
            containers: BTreeMap::new(),
            sink: None,
        })
    }

    pub fn with_sink(mut self, sink: impl SettingsSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn catalog(&self) -> Catalog<'_> {
        Catalog::new(&self.registry, &self.settings.rules)
    }

    pub fn eligible_items(&self) -> Vec<&Item> {
        self.catalog().eligible_items()
    }

    pub fn quantity_multiplier(&self, id: &ItemId) -> Result<u32> {
        let item = self
            .registry
            .item(id)
            .ok_or_else(|| DispenserError::UnknownItem(id.clone()))?;
        quantity_multiplier(item)
    }

    pub fn binding(&self, id: ContainerId) -> Option<&ContainerBinding> {
        self.containers.get(&id)
    }

    /// Restores a container from its save record. Called by the host while
    /// loading, before anything resolves the container.
    pub fn restore(&mut self, container: &ContainerHandle, record: ContainerRecord) {
        let binding = ContainerBinding::from_record(
            container.container_type.clone(),
            container.has_storage,
            record,
            &Catalog::new(&self.registry, &self.settings.rules),
        );
        self.containers.insert(container.id, binding);
    }

    pub fn container_record(&self, id: ContainerId) -> Option<ContainerRecord> {
        self.containers.get(&id).map(ContainerBinding::to_record)
    }

    pub fn detach(&mut self, id: ContainerId) -> Option<ContainerRecord> {
        self.containers.remove(&id).map(|binding| binding.to_record())
    }

    /// Resolves the item `container` serves.
    ///
    /// The first resolution of a container, and every resolution of an
    /// explicit choice, narrows its storage filter to the resolved item.
    pub fn resolve(&mut self, container: &ContainerHandle) -> Result<Resolution> {
        let Self {
            registry,
            settings,
            containers,
            ..
        } = self;
        let catalog = Catalog::new(&*registry, &settings.rules);

        let fresh = !containers.contains_key(&container.id);
        let binding = containers.entry(container.id).or_insert_with(|| {
            ContainerBinding::new(container.container_type.clone(), container.has_storage)
        });
        let resolution = binding.resolve(&catalog, &mut settings.defaults)?;
        if fresh || resolution.source == ResolutionSource::Explicit {
            binding.apply_filter(&resolution.item.id);
        }

        if let Err(err) = self.persist_settings() {
            warn!(%err, "could not persist repaired settings");
        }
        Ok(resolution)
    }

    pub fn set_choice(&mut self, container: &ContainerHandle, item: &ItemId) -> Result<()> {
        let catalog = Catalog::new(&self.registry, &self.settings.rules);
        let binding = self.containers.entry(container.id).or_insert_with(|| {
            ContainerBinding::new(container.container_type.clone(), container.has_storage)
        });
        binding.set_choice(item, &catalog)?;
        debug!(container = container.id.0, item = item.as_str(), "bound item");
        Ok(())
    }

    pub fn get_default(&mut self, container_type: &ContainerType) -> Result<Item> {
        let catalog = Catalog::new(&self.registry, &self.settings.rules);
        let item = self
            .settings
            .defaults
            .get_default(container_type, &catalog)?
            .clone();
        self.persist_settings()?;
        Ok(item)
    }

    pub fn set_default(&mut self, container_type: ContainerType, item: &ItemId) -> Result<()> {
        let catalog = Catalog::new(&self.registry, &self.settings.rules);
        self.settings
            .defaults
            .set_default(container_type, item, &catalog)?;
        self.persist_settings()
    }

    pub fn clear_default(&mut self, container_type: &ContainerType) -> Result<bool> {
        let removed = self.settings.defaults.clear_default(container_type);
        self.persist_settings()?;
        Ok(removed)
    }

    /// Flips whether `id` may be selected. Returns the new excluded state.
    pub fn toggle_excluded(&mut self, id: &ItemId) -> Result<bool> {
        if self.registry.item(id).is_none() {
            return Err(DispenserError::UnknownItem(id.clone()));
        }
        let excluded = self.settings.toggle_excluded(id, &self.registry);
        self.persist_settings()?;
        Ok(excluded)
    }

    pub fn reset_exclusions(&mut self) -> Result<()> {
        self.settings.reset_exclusions();
        self.persist_settings()
    }

    pub fn selector_command(&mut self, container: &ContainerHandle) -> Result<SelectorCommand> {
        let current = self.resolve(container)?.item;
        Ok(SelectorCommand::new(&current, &self.catalog()))
    }

    /// The item a job report should name, or `None` when it is not
    /// something a pawn can ingest.
    pub fn report_subject(&mut self, target: ReportTarget<'_>) -> Result<Option<Item>> {
        let item = match target {
            ReportTarget::Container(container) => self.resolve(container)?.item,
            ReportTarget::Item(id) => self
                .registry
                .item(id)
                .cloned()
                .ok_or_else(|| DispenserError::UnknownItem(id.clone()))?,
        };
        Ok(item.ingestible.then_some(item))
    }

    /// Writes dirty settings to `sink`, regardless of the attached one.
    pub fn flush_settings(&mut self, sink: &mut dyn SettingsSink) -> Result<()> {
        self.settings.flush(sink)
    }

    fn persist_settings(&mut self) -> Result<()> {
        match self.sink.as_mut() {
            Some(sink) => self.settings.flush(&mut **sink),
            None => Ok(()),
        }
    }
}

impl<R: HostRegistry> BindingLookup for Dispenser<R> {
    fn resolved_item(&mut self, container: &ContainerHandle) -> Result<Item> {
        Ok(self.resolve(container)?.item)
    }

    fn stack_multiplier(&mut self, container: &ContainerHandle) -> Result<u32> {
        Ok(self.resolve(container)?.multiplier)
    }
}
