use serde::{Deserialize, Serialize};

use super::il::{FieldRef, Instruction, MethodRef, OpCode};
use super::{Generator, Matcher, Rule};

/// Where a rewritten method finds the container instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerSource {
    Arg(u16),
    Local(u16),
    /// Already pushed by the instructions preceding the anchor.
    OnStack,
}

impl ContainerSource {
    fn load(self) -> Option<Instruction> {
        match self {
            ContainerSource::Arg(slot) => Some(Instruction::load_arg(slot)),
            ContainerSource::Local(slot) => Some(Instruction::load_local(slot)),
            ContainerSource::OnStack => None,
        }
    }
}

/// Symbols the spliced code uses to reach the container binding at run time,
/// plus the host symbols the rules anchor on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingContract {
    /// Static field holding the hardcoded item.
    pub anchor: FieldRef,
    /// `container -> binding`
    pub fetch_binding: MethodRef,
    /// `binding -> item`
    pub resolved_item: MethodRef,
    /// `binding -> int`
    pub multiplier: MethodRef,
    /// Stack size field of a spawned item.
    pub quantity_field: FieldRef,
    /// Host factory that spawns a new item instance.
    pub construct_item: MethodRef,
}

impl BindingContract {
    pub fn standard() -> Self {
        Self {
            anchor: FieldRef::new("RimWorld.ThingDefOf", "MealNutrientPaste"),
            fetch_binding: MethodRef::new_static("Dispenser.ContainerBinding", "For", 1, true),
            resolved_item: MethodRef::new_instance("Dispenser.ContainerBinding", "get_Item", 0, true),
            multiplier: MethodRef::new_instance(
                "Dispenser.ContainerBinding",
                "get_StackMultiplier",
                0,
                true,
            ),
            quantity_field: FieldRef::new("Verse.Thing", "stackCount"),
            construct_item: MethodRef::new_static("Verse.ThingMaker", "MakeThing", 2, true),
        }
    }

    fn binding_of(&self, source: ContainerSource) -> Vec<Instruction> {
        let mut seq: Vec<Instruction> = source.load().into_iter().collect();
        seq.push(Instruction::call(self.fetch_binding.clone()));
        seq
    }

    /// Pushes the container's resolved item.
    pub fn item_sequence(&self, source: ContainerSource) -> Vec<Instruction> {
        let mut seq = self.binding_of(source);
        seq.push(Instruction::call(self.resolved_item.clone()));
        seq
    }

    /// Pushes the container's quantity multiplier.
    pub fn multiplier_sequence(&self, source: ContainerSource) -> Vec<Instruction> {
        let mut seq = self.binding_of(source);
        seq.push(Instruction::call(self.multiplier.clone()));
        seq
    }
}

/// Parameters of the lookahead rule.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookaheadSpec {
    /// Distance from the anchor to the item factory call.
    pub distance: usize,
    /// Instructions replaced at the anchor.
    pub consumed: usize,
    /// Container for the substituted item.
    pub substitute: ContainerSource,
    /// Local that receives the spawned item.
    pub result_local: u16,
    /// Per-call argument whose binding scales the spawned stack.
    pub patch: ContainerSource,
}

impl Default for LookaheadSpec {
    fn default() -> Self {
        Self {
            distance: 4,
            consumed: 3,
            substitute: ContainerSource::OnStack,
            result_local: 2,
            patch: ContainerSource::Arg(1),
        }
    }
}

fn loads_anchor(contract: &BindingContract) -> Matcher<Instruction> {
    let anchor = contract.anchor.clone();
    Box::new(move |body: &[Instruction], i: usize| body[i].is_load_static(&anchor))
}

fn emit(seq: Vec<Instruction>) -> Generator<Instruction> {
    Box::new(move |_: &[Instruction], _: usize| seq.clone())
}

/// `ldsfld <anchor>` becomes `load container; fetch binding; get item`.
pub fn simple_substitute(contract: &BindingContract, source: ContainerSource) -> Rule<Instruction> {
    Rule::SimpleSubstitute {
        anchor: loads_anchor(contract),
        replace: emit(contract.item_sequence(source)),
    }
}

/// Like [`simple_substitute`], and multiplies the value about to be stored
/// into the quantity field by the container's multiplier.
pub fn substitute_and_scale(contract: &BindingContract, source: ContainerSource) -> Rule<Instruction> {
    let quantity = contract.quantity_field.clone();
    let mut scale = contract.multiplier_sequence(source);
    scale.push(Instruction::simple(OpCode::Mul));

    Rule::SubstituteAndScale {
        anchor: loads_anchor(contract),
        replace: emit(contract.item_sequence(source)),
        store: Box::new(move |body: &[Instruction], i: usize| body[i].is_store_field(&quantity)),
        scale: emit(scale),
    }
}

/// Before each `ret`, overwrite the returned item's quantity with the
/// container's multiplier.
pub fn result_correction(contract: &BindingContract, source: ContainerSource) -> Rule<Instruction> {
    let mut correct = vec![Instruction::simple(OpCode::Dup)];
    correct.extend(contract.multiplier_sequence(source));
    correct.push(Instruction::store_field(contract.quantity_field.clone()));

    Rule::ResultCorrection {
        exit: Box::new(|body: &[Instruction], i: usize| body[i].opcode == OpCode::Ret),
        correct: emit(correct),
    }
}

/// Substitutes the item argument of an upcoming factory call and sets the
/// spawned stack's quantity once it lands in `spec.result_local`.
pub fn lookahead_with_deferred_patch(
    contract: &BindingContract,
    spec: LookaheadSpec,
) -> Rule<Instruction> {
    let factory = contract.construct_item.clone();
    let distance = spec.distance;
    let result_local = spec.result_local;

    let mut patch = vec![Instruction::load_local(result_local)];
    patch.extend(contract.multiplier_sequence(spec.patch));
    patch.push(Instruction::store_field(contract.quantity_field.clone()));

    Rule::LookaheadWithDeferredPatch {
        anchor: Box::new(move |body: &[Instruction], i: usize| {
            body.get(i + distance)
                .map_or(false, |ins| ins.calls(&factory))
        }),
        replace: emit(contract.item_sequence(spec.substitute)),
        consumed: spec.consumed,
        local_store: Box::new(move |body: &[Instruction], i: usize| {
            body[i].is_store_local(result_local)
        }),
        patch: emit(patch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::listing::parse_listing;
    use crate::rewrite::{net_stack_effect, rewrite, StackEffect};

    fn contract() -> BindingContract {
        BindingContract::standard()
    }

    #[test]
    fn simple_substitution_preserves_stack_and_surroundings() {
        let body = parse_listing(
            "
            ldarg 0
            ldfld RimWorld.Building_NutrientPasteDispenser:powerComp
            pop
            ldsfld RimWorld.ThingDefOf:MealNutrientPaste
            ret
            ",
        )
        .unwrap();
        let k = 3;

        let out = rewrite(&body, &simple_substitute(&contract(), ContainerSource::Arg(0)));
        let window = contract().item_sequence(ContainerSource::Arg(0));

        assert_eq!(out.body.len(), body.len() - 1 + window.len());
        assert_eq!(net_stack_effect(&out.body), net_stack_effect(&body));
        assert_eq!(net_stack_effect(&window), body[k].stack_delta());
        assert_eq!(&out.body[..k], &body[..k]);
        assert_eq!(&out.body[k..k + window.len()], window.as_slice());
        assert_eq!(&out.body[k + window.len()..], &body[k + 1..]);
    }

    #[test]
    fn local_slot_source_loads_that_local() {
        let body = parse_listing("ldsfld RimWorld.ThingDefOf:MealNutrientPaste").unwrap();
        let out = rewrite(&body, &simple_substitute(&contract(), ContainerSource::Local(1)));
        assert_eq!(out.body[0], Instruction::load_local(1));
        assert!(out.body[1].calls(&contract().fetch_binding));
        assert!(out.body[2].calls(&contract().resolved_item));
    }

    #[test]
    fn scaled_write_multiplies_before_store() {
        let body = parse_listing(
            "
            ldsfld RimWorld.ThingDefOf:MealNutrientPaste
            ldnull
            call Verse.ThingMaker:MakeThing/2 -> value
            dup
            ldc 1
            stfld Verse.Thing:stackCount
            ret
            ",
        )
        .unwrap();

        let out = rewrite(&body, &substitute_and_scale(&contract(), ContainerSource::Local(0)));
        assert_eq!(out.stats.anchors, 1);
        assert_eq!(out.stats.scaled_stores, 1);
        assert_eq!(net_stack_effect(&out.body), net_stack_effect(&body));

        let store = out
            .body
            .iter()
            .position(|ins| ins.is_store_field(&contract().quantity_field))
            .unwrap();
        assert_eq!(out.body[store - 1].opcode, OpCode::Mul);
        assert!(out.body[store - 2].calls(&contract().multiplier));
        assert_eq!(out.body[store - 5], Instruction::load_int(1));
    }

    #[test]
    fn result_correction_is_stack_neutral() {
        let body = parse_listing(
            "
            ldsfld RimWorld.ThingDefOf:MealNutrientPaste
            ldnull
            call Verse.ThingMaker:MakeThing/2 -> value
            ret
            ",
        )
        .unwrap();
        let rule = result_correction(&contract(), ContainerSource::Arg(0));
        let out = rewrite(&body, &rule);

        assert_eq!(out.stats.corrected_exits, 1);
        assert_eq!(net_stack_effect(&out.body), net_stack_effect(&body));
        assert_eq!(out.body.last(), Some(&Instruction::simple(OpCode::Ret)));
        assert_eq!(out.body[3], Instruction::simple(OpCode::Dup));
    }

    #[test]
    fn lookahead_rule_substitutes_and_patches_local() {
        let body = parse_listing(
            "
            ldarg 1
            ldarg 0
            ldfld NutrientPasteTiers.NPDHarmony:tier
            ldsfld RimWorld.ThingDefOf:MealNutrientPaste
            pop
            ldnull
            call Verse.ThingMaker:MakeThing/2 -> value
            stloc 2
            ldloc 2
            ret
            ",
        )
        .unwrap();
        let rule = lookahead_with_deferred_patch(&contract(), LookaheadSpec::default());
        let out = rewrite(&body, &rule);

        assert_eq!(out.stats.anchors, 1);
        assert_eq!(out.stats.patched_locals, 1);

        // Anchor fires at index 2 (MakeThing sits at 6) and swallows 2..=4.
        assert_eq!(out.body[0], Instruction::load_arg(1));
        assert_eq!(out.body[1], Instruction::load_arg(0));
        assert!(out.body[2].calls(&contract().fetch_binding));
        assert!(out.body[3].calls(&contract().resolved_item));
        assert_eq!(out.body[4].opcode, OpCode::LoadNull);

        let store = out
            .body
            .iter()
            .position(|ins| ins.is_store_local(2))
            .unwrap();
        assert_eq!(out.body[store + 1], Instruction::load_local(2));
        assert_eq!(out.body[store + 2], Instruction::load_arg(1));
        assert!(out.body[store + 4].calls(&contract().multiplier));
        assert!(out.body[store + 5].is_store_field(&contract().quantity_field));
    }

    #[test]
    fn standard_contract_sequences_push_one_value() {
        for source in [ContainerSource::Arg(0), ContainerSource::Local(1)] {
            assert_eq!(net_stack_effect(&contract().item_sequence(source)), 1);
            assert_eq!(net_stack_effect(&contract().multiplier_sequence(source)), 1);
        }
        assert_eq!(net_stack_effect(&contract().item_sequence(ContainerSource::OnStack)), 0);
    }
}
