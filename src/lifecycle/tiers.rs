//! Teardown tiers
//!
//! Teardown escalates `ownership transfer → cascading drop-owned → dependency walk →
//! quarantine` and stops at the first tier that leaves the tenant's roles unreferenced. Which
//! stage runs next is a pure function of the stage that just ran and what still blocks it.

use petgraph::{
    algo::toposort,
    graph::{DiGraph, NodeIndex},
};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{
    registry::TeardownStage,
    store::{Dependency, ObjectRef},
};

/// Maximum length of a primary store identifier.
const MAX_NAME_LEN: usize = 63;

/// What was left after running a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierOutcome {
    /// Nothing references the tenant's roles any more.
    Resolved,

    /// Objects still reference the roles; a stronger tier may clear them.
    StillReferenced,

    /// A dependency cannot be removed by any tier.
    Irrecoverable,
}

/// Stage to run after `stage` finished with `outcome`.
#[must_use]
pub const fn next_stage(stage: TeardownStage, outcome: TierOutcome) -> TeardownStage {
    match (stage, outcome) {
        (TeardownStage::Finalize, _) | (_, TierOutcome::Resolved) => TeardownStage::Finalize,
        (TeardownStage::OwnershipTransfer, TierOutcome::StillReferenced) => {
            TeardownStage::CascadingDropOwned
        }
        (TeardownStage::CascadingDropOwned, TierOutcome::StillReferenced) => {
            TeardownStage::DependencyWalk
        }
        (
            TeardownStage::DependencyWalk | TeardownStage::Quarantine,
            TierOutcome::StillReferenced,
        )
        | (_, TierOutcome::Irrecoverable) => TeardownStage::Quarantine,
    }
}

/// Whether `stage` is one of the resolving tiers 1–3.
#[must_use]
pub const fn is_resolving_tier(stage: TeardownStage) -> bool {
    matches!(
        stage,
        TeardownStage::OwnershipTransfer
            | TeardownStage::CascadingDropOwned
            | TeardownStage::DependencyWalk
    )
}

/// Requirement cycle among dependencies; no clearing order exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("dependency cycle through {} objects", .objects.len())]
pub struct DependencyCycle {
    /// Objects on or next to the cycle.
    pub objects: Vec<ObjectRef>,
}

/// Dependencies in an order where every object comes after the objects it requires.
///
/// # Errors
///
/// Returns a [`DependencyCycle`] when requirements form a cycle.
pub fn clearing_order(dependencies: &[Dependency]) -> Result<Vec<&Dependency>, DependencyCycle> {
    let mut graph = DiGraph::<&Dependency, ()>::with_capacity(dependencies.len(), 0);
    let mut by_object: FxHashMap<&ObjectRef, Vec<NodeIndex>> = FxHashMap::default();

    let nodes: Vec<NodeIndex> = dependencies
        .iter()
        .map(|dependency| {
            let node = graph.add_node(dependency);

            by_object.entry(&dependency.object).or_default().push(node);

            node
        })
        .collect();

    for (&dependent, dependency) in nodes.iter().zip(dependencies) {
        for required in &dependency.requires {
            for &prerequisite in by_object.get(required).into_iter().flatten() {
                if prerequisite != dependent {
                    graph.add_edge(prerequisite, dependent, ());
                }
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order
            .into_iter()
            .filter_map(|node| graph.node_weight(node).copied())
            .collect()),
        Err(cycle) => Err(DependencyCycle {
            objects: graph
                .node_weight(cycle.node_id())
                .map(|dependency| {
                    std::iter::once(&dependency.object)
                        .chain(&dependency.requires)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
        }),
    }
}

/// Name a quarantined object or database is renamed to.
///
/// `stamp` is a compact UTC timestamp of digits; the result is a valid unquoted identifier of
/// at most 63 characters.
#[must_use]
pub fn quarantine_name(stamp: &str, original: &str) -> String {
    let sanitized: String = original
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    let mut name = format!("q{stamp}_{sanitized}");

    name.truncate(MAX_NAME_LEN);

    name
}
