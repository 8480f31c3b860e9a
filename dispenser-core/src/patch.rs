//! Start-up installation of the rewrite rules into host methods.
//!
//! Targets are data: a [`PatchTable`] lists each method with the rule shape
//! it needs and the host versions and optional packages it applies to. The
//! table is filtered once against the running host, then every surviving
//! target is rewritten and installed exactly once.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::rewrite::il::Instruction;
use crate::rewrite::listing::parse_listing;
use crate::rewrite::rules::{self, BindingContract, ContainerSource, LookaheadSpec};
use crate::rewrite::{rewrite, RewriteStats, Rule, RuleKind};
use crate::{DispenserError, Result};

/// Package id of the optional tap, dripper and feeder buildings.
pub const EXPANDED_PASTE_PACKAGE: &str = "vanillaexpanded.vnutriente";

/// Package id of the tiered custom-food dispenser.
pub const PASTE_TIERS_PACKAGE: &str = "mlie.npdtiers";

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostVersion {
    pub major: u16,
    pub minor: u16,
}

impl HostVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Accepts `1.5` and longer build strings such as `1.5.4104 rev435`.
impl FromStr for HostVersion {
    type Err = DispenserError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || DispenserError::UnknownHostVersion(s.to_string());
        let head = s.split_whitespace().next().ok_or_else(bad)?;
        let mut parts = head.split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for HostVersion {
    type Error = DispenserError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<HostVersion> for String {
    fn from(version: HostVersion) -> Self {
        version.to_string()
    }
}

/// Declarative form of one of the four rule variants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum RuleShape {
    SimpleSubstitute { container: ContainerSource },
    SubstituteAndScale { container: ContainerSource },
    ResultCorrection { container: ContainerSource },
    LookaheadWithDeferredPatch(LookaheadSpec),
}

impl RuleShape {
    pub fn kind(&self) -> RuleKind {
        match self {
            RuleShape::SimpleSubstitute { .. } => RuleKind::SimpleSubstitute,
            RuleShape::SubstituteAndScale { .. } => RuleKind::SubstituteAndScale,
            RuleShape::ResultCorrection { .. } => RuleKind::ResultCorrection,
            RuleShape::LookaheadWithDeferredPatch(_) => RuleKind::LookaheadWithDeferredPatch,
        }
    }

    /// The substituting shapes replace a lone `ldsfld`, so their item read
    /// has to push exactly one value. Only the lookahead finds its container
    /// already on the stack.
    pub fn check(&self) -> Result<()> {
        match self {
            RuleShape::SimpleSubstitute { container }
            | RuleShape::SubstituteAndScale { container }
            | RuleShape::ResultCorrection { container }
                if *container == ContainerSource::OnStack =>
            {
                Err(DispenserError::StackSourceUnsupported(self.kind()))
            }
            _ => Ok(()),
        }
    }

    pub fn build(&self, contract: &BindingContract) -> Result<Rule<Instruction>> {
        self.check()?;
        Ok(match self {
            RuleShape::SimpleSubstitute { container } => rules::simple_substitute(contract, *container),
            RuleShape::SubstituteAndScale { container } => {
                rules::substitute_and_scale(contract, *container)
            }
            RuleShape::ResultCorrection { container } => rules::result_correction(contract, *container),
            RuleShape::LookaheadWithDeferredPatch(spec) => {
                rules::lookahead_with_deferred_patch(contract, *spec)
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTarget {
    pub method: String,
    pub rule: RuleShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<HostVersion>,
    // exclusive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<HostVersion>,
}

impl PatchTarget {
    fn new(method: &str, rule: RuleShape) -> Self {
        Self {
            method: method.to_string(),
            rule,
            requires_package: None,
            since: None,
            before: None,
        }
    }

    fn requires(mut self, package: &str) -> Self {
        self.requires_package = Some(package.to_string());
        self
    }

    pub fn covers(&self, version: HostVersion) -> bool {
        self.since.map_or(true, |since| version >= since)
            && self.before.map_or(true, |before| version < before)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTable {
    pub targets: Vec<PatchTarget>,
}

impl PatchTable {
    /// Every method that hardcodes the nutrient paste meal, across the
    /// supported host releases and optional packages.
    pub fn standard() -> Self {
        let simple = |container| RuleShape::SimpleSubstitute { container };
        let dispenser = ContainerSource::Arg(0);
        let food_search_local = ContainerSource::Local(1);
        let v1_5 = HostVersion::new(1, 5);

        let mut targets = vec![
            PatchTarget::new(
                "RimWorld.Building_NutrientPasteDispenser:get_DispensableDef",
                simple(dispenser),
            ),
            PatchTarget::new(
                "RimWorld.Building_NutrientPasteDispenser:TryDispenseFood",
                simple(dispenser),
            ),
            PatchTarget::new(
                "RimWorld.Building_NutrientPasteDispenser:TryDispenseFood",
                RuleShape::ResultCorrection {
                    container: dispenser,
                },
            ),
            PatchTarget {
                before: Some(v1_5),
                ..PatchTarget::new(
                    "RimWorld.FoodUtility+<>c__DisplayClass19_0:<BestFoodSourceOnMap_NewTemp>b__0",
                    simple(food_search_local),
                )
            },
            PatchTarget {
                since: Some(v1_5),
                ..PatchTarget::new(
                    "RimWorld.FoodUtility+<>c__DisplayClass14_0:<BestFoodSourceOnMap>b__0",
                    simple(food_search_local),
                )
            },
        ];

        for method in [
            "VNPE.Building_Dripper:TickRare",
            "VNPE.Building_NutrientPasteDispenser_GetGizmos:TryDropFood",
            "VNPE.Building_NutrientPasteDispenser_TryDispenseFood:Prefix",
            "VNPE.Building_NutrientPasteTap:TryDispenseFoodOverride",
            "VNPE.Building_NutrientPasteTap:TryDropFood",
        ] {
            targets.push(PatchTarget::new(method, simple(dispenser)).requires(EXPANDED_PASTE_PACKAGE));
        }
        targets.push(
            PatchTarget::new(
                "VNPE.CompConvertToThing_OutputResource:Prefix",
                RuleShape::SubstituteAndScale {
                    container: ContainerSource::Local(0),
                },
            )
            .requires(EXPANDED_PASTE_PACKAGE),
        );
        targets.push(
            PatchTarget::new(
                "NutrientPasteTiers.NPDHarmony:TryDispenseCustomFood",
                RuleShape::LookaheadWithDeferredPatch(LookaheadSpec::default()),
            )
            .requires(PASTE_TIERS_PACKAGE),
        );

        Self { targets }
    }

    pub fn from_json(src: &str) -> Result<Self> {
        let table: Self = serde_json::from_str(src)?;
        for target in &table.targets {
            target.rule.check()?;
        }
        Ok(table)
    }

    pub fn select(&self, host: &dyn MethodHost) -> Vec<&PatchTarget> {
        let version = host.host_version();
        self.targets
            .iter()
            .filter(|target| target.covers(version))
            .filter(|target| {
                target
                    .requires_package
                    .as_deref()
                    .map_or(true, |package| host.package_active(package))
            })
            .collect()
    }
}

/// Access to the host's method bodies during start-up.
pub trait MethodHost {
    fn host_version(&self) -> HostVersion;

    fn package_active(&self, package: &str) -> bool;

    /// Current body of `method`, or `None` if the host has no such method.
    fn method_body(&self, method: &str) -> Option<Vec<Instruction>>;

    /// Replaces the body of `method` for every later invocation.
    fn install_body(&mut self, method: &str, body: Vec<Instruction>) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryHost {
    version: HostVersion,
    packages: BTreeSet<String>,
    methods: BTreeMap<String, Vec<Instruction>>,
}

impl MemoryHost {
    pub fn new(version: HostVersion) -> Self {
        Self {
            version,
            packages: BTreeSet::new(),
            methods: BTreeMap::new(),
        }
    }

    pub fn from_listings<'s>(
        version: HostVersion,
        packages: impl IntoIterator<Item = String>,
        listings: impl IntoIterator<Item = (&'s str, &'s str)>,
    ) -> Result<Self> {
        let mut host = Self::new(version);
        host.packages.extend(packages);
        for (method, listing) in listings {
            host.insert_method(method, parse_listing(listing)?);
        }
        Ok(host)
    }

    pub fn activate_package(&mut self, package: &str) {
        self.packages.insert(package.to_string());
    }

    pub fn insert_method(&mut self, method: &str, body: Vec<Instruction>) {
        self.methods.insert(method.to_string(), body);
    }

    pub fn method(&self, method: &str) -> Option<&[Instruction]> {
        self.methods.get(method).map(Vec::as_slice)
    }

    pub fn methods(&self) -> impl Iterator<Item = (&str, &[Instruction])> {
        self.methods
            .iter()
            .map(|(name, body)| (name.as_str(), body.as_slice()))
    }
}

impl MethodHost for MemoryHost {
    fn host_version(&self) -> HostVersion {
        self.version
    }

    fn package_active(&self, package: &str) -> bool {
        self.packages.contains(package)
    }

    fn method_body(&self, method: &str) -> Option<Vec<Instruction>> {
        self.methods.get(method).cloned()
    }

    fn install_body(&mut self, method: &str, body: Vec<Instruction>) -> Result<()> {
        self.methods.insert(method.to_string(), body);
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PatchStatus {
    Applied,
    /// The rule found nothing to rewrite; the body was left alone.
    AnchorMissing,
    MethodMissing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchOutcome {
    pub method: String,
    pub kind: RuleKind,
    pub status: PatchStatus,
    pub stats: RewriteStats,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub outcomes: Vec<PatchOutcome>,
    /// Targets filtered out by host version or inactive package.
    pub skipped: Vec<String>,
}

impl PatchReport {
    pub fn count(&self, status: PatchStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Applies rules to host methods, at most once per method and rule kind.
pub struct PatchInstaller {
    contract: BindingContract,
    patched: BTreeSet<(String, RuleKind)>,
}

impl Default for PatchInstaller {
    fn default() -> Self {
        Self::new(BindingContract::standard())
    }
}

impl PatchInstaller {
    pub fn new(contract: BindingContract) -> Self {
        Self {
            contract,
            patched: BTreeSet::new(),
        }
    }

    pub fn contract(&self) -> &BindingContract {
        &self.contract
    }

    pub fn is_patched(&self, method: &str, kind: RuleKind) -> bool {
        self.patched.contains(&(method.to_string(), kind))
    }

    /// Rewrites one target. A missing method or anchor is reported in the
    /// outcome, not as an error; applying the same target twice is.
    pub fn apply(&mut self, target: &PatchTarget, host: &mut dyn MethodHost) -> Result<PatchOutcome> {
        let kind = target.rule.kind();
        let rule = target.rule.build(&self.contract)?;
        let key = (target.method.clone(), kind);
        if self.patched.contains(&key) {
            return Err(DispenserError::AlreadyPatched {
                method: target.method.clone(),
                kind,
            });
        }

        let Some(body) = host.method_body(&target.method) else {
            warn!(method = %target.method, "method not found in host; skipping");
            return Ok(PatchOutcome {
                method: target.method.clone(),
                kind,
                status: PatchStatus::MethodMissing,
                stats: RewriteStats::default(),
            });
        };

        let rewritten = rewrite(&body, &rule);
        let status = if rewritten.is_noop() {
            warn!(method = %target.method, %kind, "anchor not found; method left unchanged");
            PatchStatus::AnchorMissing
        } else {
            host.install_body(&target.method, rewritten.body)?;
            debug!(method = %target.method, %kind, stats = ?rewritten.stats, "patched");
            PatchStatus::Applied
        };
        self.patched.insert(key);

        Ok(PatchOutcome {
            method: target.method.clone(),
            kind,
            status,
            stats: rewritten.stats,
        })
    }

    pub fn install_table(&mut self, table: &PatchTable, host: &mut dyn MethodHost) -> Result<PatchReport> {
        let mut report = PatchReport::default();
        let selected = table.select(&*host);
        for target in &table.targets {
            if !selected.iter().any(|s| std::ptr::eq(*s, target)) {
                debug!(method = %target.method, "target does not apply to this host");
                report.skipped.push(target.method.clone());
            }
        }

        for target in selected {
            report.outcomes.push(self.apply(target, host)?);
        }

        info!(
            version = %host.host_version(),
            applied = report.count(PatchStatus::Applied),
            anchor_missing = report.count(PatchStatus::AnchorMissing),
            method_missing = report.count(PatchStatus::MethodMissing),
            skipped = report.skipped.len(),
            "installed patch table"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::il::OpCode;
    use crate::rewrite::net_stack_effect;

    const DISPENSABLE_DEF: &str = "
        ldsfld RimWorld.ThingDefOf:MealNutrientPaste
        ret
    ";

    const TRY_DISPENSE: &str = "
        ldarg 0
        call instance RimWorld.Building_NutrientPasteDispenser:FindFeedInAnyHopper/0 -> value
        pop
        ldsfld RimWorld.ThingDefOf:MealNutrientPaste
        ldnull
        call Verse.ThingMaker:MakeThing/2 -> value
        ret
    ";

    const FOOD_SEARCH_1_5: &str = "
        ldarg 1
        ldsfld RimWorld.ThingDefOf:MealNutrientPaste
        call Verse.ThingMaker:MakeThing/2 -> value
        ret
    ";

    fn host(version: HostVersion) -> MemoryHost {
        MemoryHost::from_listings(
            version,
            Vec::new(),
            [
                ("RimWorld.Building_NutrientPasteDispenser:get_DispensableDef", DISPENSABLE_DEF),
                ("RimWorld.Building_NutrientPasteDispenser:TryDispenseFood", TRY_DISPENSE),
                (
                    "RimWorld.FoodUtility+<>c__DisplayClass14_0:<BestFoodSourceOnMap>b__0",
                    FOOD_SEARCH_1_5,
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn parses_host_versions() {
        assert_eq!("1.5".parse::<HostVersion>().unwrap(), HostVersion::new(1, 5));
        assert_eq!(
            "1.4.3901 rev10".parse::<HostVersion>().unwrap(),
            HostVersion::new(1, 4)
        );
        assert!(matches!(
            "one.five".parse::<HostVersion>(),
            Err(DispenserError::UnknownHostVersion(_))
        ));
        assert!(HostVersion::new(1, 4) < HostVersion::new(1, 5));
    }

    #[test]
    fn selects_food_search_closure_by_version() {
        let table = PatchTable::standard();
        let methods = |version| {
            table
                .select(&MemoryHost::new(version))
                .into_iter()
                .map(|t| t.method.as_str())
                .filter(|m| m.starts_with("RimWorld.FoodUtility"))
                .collect::<Vec<_>>()
        };
        assert_eq!(
            methods(HostVersion::new(1, 4)),
            vec!["RimWorld.FoodUtility+<>c__DisplayClass19_0:<BestFoodSourceOnMap_NewTemp>b__0"]
        );
        assert_eq!(
            methods(HostVersion::new(1, 5)),
            vec!["RimWorld.FoodUtility+<>c__DisplayClass14_0:<BestFoodSourceOnMap>b__0"]
        );
    }

    #[test]
    fn optional_targets_need_their_package() {
        let table = PatchTable::standard();
        let mut host = MemoryHost::new(HostVersion::new(1, 5));
        let base = table.select(&host).len();
        assert_eq!(base, 4);

        host.activate_package(EXPANDED_PASTE_PACKAGE);
        assert_eq!(table.select(&host).len(), base + 6);
        host.activate_package(PASTE_TIERS_PACKAGE);
        assert_eq!(table.select(&host).len(), base + 7);
    }

    #[test]
    fn installs_standard_table() {
        let mut host = host(HostVersion::new(1, 5));
        let mut installer = PatchInstaller::default();
        let report = installer
            .install_table(&PatchTable::standard(), &mut host)
            .unwrap();

        assert_eq!(report.count(PatchStatus::Applied), 4);
        assert_eq!(report.skipped.len(), 8);

        let dispense = host
            .method("RimWorld.Building_NutrientPasteDispenser:TryDispenseFood")
            .unwrap();
        let original = parse_listing(TRY_DISPENSE).unwrap();
        // One anchor becomes three instructions, one correction adds five.
        assert_eq!(dispense.len(), original.len() + 2 + 5);
        assert_eq!(net_stack_effect(dispense), net_stack_effect(&original));
        assert!(!dispense
            .iter()
            .any(|ins| ins.is_load_static(&installer.contract().anchor)));
        assert_eq!(dispense.last().map(|ins| ins.opcode), Some(OpCode::Ret));

        let search = host
            .method("RimWorld.FoodUtility+<>c__DisplayClass14_0:<BestFoodSourceOnMap>b__0")
            .unwrap();
        assert_eq!(search[1], Instruction::load_local(1));
    }

    #[test]
    fn refuses_to_patch_twice() {
        let mut host = host(HostVersion::new(1, 5));
        let mut installer = PatchInstaller::default();
        let target = PatchTarget::new(
            "RimWorld.Building_NutrientPasteDispenser:get_DispensableDef",
            RuleShape::SimpleSubstitute {
                container: ContainerSource::Arg(0),
            },
        );

        installer.apply(&target, &mut host).unwrap();
        let once = host.method(&target.method).unwrap().to_vec();
        let err = installer.apply(&target, &mut host).unwrap_err();
        assert!(matches!(err, DispenserError::AlreadyPatched { .. }));
        assert_eq!(host.method(&target.method).unwrap(), once.as_slice());
    }

    #[test]
    fn missing_anchor_and_method_are_reported() {
        let mut host = MemoryHost::from_listings(
            HostVersion::new(1, 5),
            Vec::new(),
            [("RimWorld.Building_NutrientPasteDispenser:get_DispensableDef", "ldnull\nret")],
        )
        .unwrap();
        let mut installer = PatchInstaller::default();
        let report = installer
            .install_table(&PatchTable::standard(), &mut host)
            .unwrap();

        assert_eq!(report.count(PatchStatus::AnchorMissing), 1);
        assert_eq!(report.count(PatchStatus::MethodMissing), 3);
        assert_eq!(
            host.method("RimWorld.Building_NutrientPasteDispenser:get_DispensableDef")
                .unwrap()
                .len(),
            2
        );
        assert!(installer.is_patched(
            "RimWorld.Building_NutrientPasteDispenser:get_DispensableDef",
            RuleKind::SimpleSubstitute
        ));
    }

    #[test]
    fn substituting_shapes_reject_stack_container() {
        let json = r#"{
            "targets": [
                { "method": "Mod.Feeder:Feed",
                  "rule": { "shape": "simple_substitute", "container": "on_stack" } }
            ]
        }"#;
        let err = PatchTable::from_json(json).unwrap_err();
        assert!(matches!(
            err,
            DispenserError::StackSourceUnsupported(RuleKind::SimpleSubstitute)
        ));

        let mut host = host(HostVersion::new(1, 5));
        let mut installer = PatchInstaller::default();
        let method = "RimWorld.Building_NutrientPasteDispenser:TryDispenseFood";
        let before = host.method(method).unwrap().to_vec();
        for rule in [
            RuleShape::SubstituteAndScale {
                container: ContainerSource::OnStack,
            },
            RuleShape::ResultCorrection {
                container: ContainerSource::OnStack,
            },
        ] {
            let kind = rule.kind();
            let err = installer.apply(&PatchTarget::new(method, rule), &mut host).unwrap_err();
            assert!(matches!(err, DispenserError::StackSourceUnsupported(k) if k == kind));
            assert!(!installer.is_patched(method, kind));
        }
        assert_eq!(host.method(method).unwrap(), before.as_slice());
    }

    #[test]
    fn table_round_trips_through_json() {
        let json = r#"{
            "targets": [
                { "method": "Mod.Feeder:Feed",
                  "rule": { "shape": "substitute_and_scale", "container": { "local": 0 } },
                  "since": "1.4" },
                { "method": "Mod.Tiers:Dispense",
                  "rule": { "shape": "lookahead_with_deferred_patch", "result_local": 3 },
                  "requires_package": "mod.tiers" }
            ]
        }"#;
        let table = PatchTable::from_json(json).unwrap();
        assert_eq!(table.targets[0].since, Some(HostVersion::new(1, 4)));
        assert_eq!(
            table.targets[1].rule,
            RuleShape::LookaheadWithDeferredPatch(LookaheadSpec {
                result_local: 3,
                ..LookaheadSpec::default()
            })
        );

        let standard = PatchTable::standard();
        let reparsed = PatchTable::from_json(&serde_json::to_string(&standard).unwrap()).unwrap();
        assert_eq!(reparsed, standard);
    }
}
