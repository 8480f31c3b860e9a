//! Load-time rewriting of host method bodies.
//!
//! A [`Rule`] is a pure description of one narrow edit: which positions of an
//! instruction stream to look for and what to emit in their place. [`rewrite`]
//! applies a rule in a single forward pass and never reorders or drops the
//! instructions it does not match. The engine is generic over the instruction
//! type; [`il`] provides the representation used for the host's methods.

pub mod il;
pub mod listing;
pub mod rules;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Net change in evaluation-stack depth caused by one instruction.
pub trait StackEffect {
    fn stack_delta(&self) -> i32;
}

pub fn net_stack_effect<I: StackEffect>(body: &[I]) -> i32 {
    body.iter().map(StackEffect::stack_delta).sum()
}

/// Predicate over a position in a method body. It may inspect neighbouring
/// instructions but never mutates anything.
pub type Matcher<I> = Box<dyn Fn(&[I], usize) -> bool>;

/// Produces the instructions to emit for a matched position.
pub type Generator<I> = Box<dyn Fn(&[I], usize) -> Vec<I>>;

pub enum Rule<I> {
    /// Replace every anchor with the generated sequence.
    SimpleSubstitute {
        anchor: Matcher<I>,
        replace: Generator<I>,
    },
    /// Replace anchors, and once an anchor has been seen insert `scale`
    /// immediately before every matching quantity store.
    SubstituteAndScale {
        anchor: Matcher<I>,
        replace: Generator<I>,
        store: Matcher<I>,
        scale: Generator<I>,
    },
    /// Insert `correct` before every method exit so the returned object is
    /// fixed up after the original body has produced it.
    ResultCorrection {
        exit: Matcher<I>,
        correct: Generator<I>,
    },
    /// Replace `consumed` instructions starting at each anchor (the anchor
    /// matcher usually looks ahead), and independently append `patch` right
    /// after every matching local store.
    LookaheadWithDeferredPatch {
        anchor: Matcher<I>,
        replace: Generator<I>,
        consumed: usize,
        local_store: Matcher<I>,
        patch: Generator<I>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    SimpleSubstitute,
    SubstituteAndScale,
    ResultCorrection,
    LookaheadWithDeferredPatch,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleKind::SimpleSubstitute => "simple-substitute",
            RuleKind::SubstituteAndScale => "substitute-and-scale",
            RuleKind::ResultCorrection => "result-correction",
            RuleKind::LookaheadWithDeferredPatch => "lookahead-with-deferred-patch",
        };
        f.write_str(name)
    }
}

impl<I> Rule<I> {
    pub fn kind(&self) -> RuleKind {
        match self {
            Rule::SimpleSubstitute { .. } => RuleKind::SimpleSubstitute,
            Rule::SubstituteAndScale { .. } => RuleKind::SubstituteAndScale,
            Rule::ResultCorrection { .. } => RuleKind::ResultCorrection,
            Rule::LookaheadWithDeferredPatch { .. } => RuleKind::LookaheadWithDeferredPatch,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub anchors: usize,
    pub scaled_stores: usize,
    pub corrected_exits: usize,
    pub patched_locals: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Rewritten<I> {
    pub body: Vec<I>,
    pub kind: RuleKind,
    pub stats: RewriteStats,
}

impl<I> Rewritten<I> {
    /// True when the rule's primary pattern never matched; the body is then
    /// identical to the input.
    pub fn is_noop(&self) -> bool {
        match self.kind {
            RuleKind::ResultCorrection => self.stats.corrected_exits == 0,
            RuleKind::LookaheadWithDeferredPatch => {
                self.stats.anchors == 0 && self.stats.patched_locals == 0
            }
            _ => self.stats.anchors == 0,
        }
    }
}

/// Applies `rule` to `body` in one forward pass.
pub fn rewrite<I: Clone>(body: &[I], rule: &Rule<I>) -> Rewritten<I> {
    let mut out = Vec::with_capacity(body.len());
    let mut stats = RewriteStats::default();

    match rule {
        Rule::SimpleSubstitute { anchor, replace } => {
            for (i, ins) in body.iter().enumerate() {
                if anchor(body, i) {
                    out.extend(replace(body, i));
                    stats.anchors += 1;
                } else {
                    out.push(ins.clone());
                }
            }
        }

        Rule::SubstituteAndScale {
            anchor,
            replace,
            store,
            scale,
        } => {
            for (i, ins) in body.iter().enumerate() {
                if anchor(body, i) {
                    out.extend(replace(body, i));
                    stats.anchors += 1;
                    continue;
                }
                // The quantity expression is already on the stack here, so
                // the multiply lands between its evaluation and the store.
                if stats.anchors > 0 && store(body, i) {
                    out.extend(scale(body, i));
                    stats.scaled_stores += 1;
                }
                out.push(ins.clone());
            }
        }

        Rule::ResultCorrection { exit, correct } => {
            for (i, ins) in body.iter().enumerate() {
                if exit(body, i) {
                    out.extend(correct(body, i));
                    stats.corrected_exits += 1;
                }
                out.push(ins.clone());
            }
        }

        Rule::LookaheadWithDeferredPatch {
            anchor,
            replace,
            consumed,
            local_store,
            patch,
        } => {
            let mut i = 0;
            while i < body.len() {
                let next = if anchor(body, i) {
                    out.extend(replace(body, i));
                    stats.anchors += 1;
                    (i + (*consumed).max(1)).min(body.len())
                } else {
                    out.push(body[i].clone());
                    i + 1
                };
                if local_store(body, i) {
                    out.extend(patch(body, i));
                    stats.patched_locals += 1;
                }
                i = next;
            }
        }
    }

    Rewritten {
        body: out,
        kind: rule.kind(),
        stats,
    }
}
