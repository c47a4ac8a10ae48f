//! Pure phase logic: turning a phase's inputs into task groups, and a
//! finished phase's task groups into the next phase's inputs.
//!
//! Nothing here touches the store, so every rule can be tested directly.

use std::collections::HashMap;

use common::{Phase, PhaseType, TaskError, TaskGroup, ValidationError, EJ_INTERNAL};
use mrl_store::Locations;
use rand::seq::SliceRandom;
use rand::Rng;

/// Where a phase is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PhaseState {
    NotStarted,
    Dispatched,
    Completed,
}

/// The task groups to create for one phase.
#[derive(Debug, Default)]
pub struct PhasePlan {
    pub groups: Vec<TaskGroup>,

    /// Inputs no storage node claims to hold. These are never dispatched.
    pub unlocated: Vec<String>,

    /// Tasks the groups stand for: one per key for per-key phases, one per
    /// reducer otherwise.
    pub tasks: u64,
}

/// Plan the task groups for phase `phase_num` over `inputs`.
///
/// * storage-map: one task per key, on the first node holding it, grouped
///   by host in the order hosts first appear.
/// * generic: one task per key, spread round-robin over every node that
///   holds some input.
/// * reduce: `count` groups, each consuming the whole input stream, each on
///   a randomly chosen node.
///
/// Every planned group is validated before it is returned.
pub fn plan_phase<R: Rng + ?Sized>(
    job_id: &str,
    phase: &Phase,
    phase_num: u32,
    inputs: &[String],
    located: &Locations,
    rng: &mut R,
) -> Result<PhasePlan, ValidationError> {
    let mut unlocated = Vec::new();
    let mut placed: Vec<(&String, &String)> = Vec::new();
    for key in inputs {
        match located.get(key).and_then(|nodes| nodes.first()) {
            Some(node) => placed.push((key, node)),
            None => unlocated.push(key.clone()),
        }
    }

    let mut plan = PhasePlan {
        unlocated,
        ..PhasePlan::default()
    };
    if placed.is_empty() {
        return Ok(plan);
    }

    match phase.kind {
        PhaseType::StorageMap => {
            let mut by_host: Vec<(String, Vec<String>)> = Vec::new();
            let mut index: HashMap<&str, usize> = HashMap::new();
            for (key, node) in &placed {
                let slot = *index.entry(node.as_str()).or_insert_with(|| {
                    by_host.push((node.to_string(), Vec::new()));
                    by_host.len() - 1
                });
                by_host[slot].1.push(key.to_string());
            }
            plan.tasks = placed.len() as u64;
            plan.groups = by_host
                .into_iter()
                .map(|(host, keys)| TaskGroup::dispatch(job_id, host, phase, phase_num, keys))
                .collect();
        }
        PhaseType::Generic => {
            let nodes = node_union(inputs, located);
            let mut buckets: Vec<Vec<String>> = vec![Vec::new(); nodes.len()];
            for (i, (key, _)) in placed.iter().enumerate() {
                buckets[i % nodes.len()].push(key.to_string());
            }
            plan.tasks = placed.len() as u64;
            plan.groups = nodes
                .into_iter()
                .zip(buckets)
                .filter(|(_, keys)| !keys.is_empty())
                .map(|(host, keys)| TaskGroup::dispatch(job_id, host, phase, phase_num, keys))
                .collect();
        }
        PhaseType::Reduce => {
            let nodes = node_union(inputs, located);
            let stream: Vec<String> = placed.iter().map(|(key, _)| key.to_string()).collect();
            for partition in 0..phase.reducer_count() {
                let Some(host) = nodes.choose(rng) else {
                    break;
                };
                let mut group =
                    TaskGroup::dispatch(job_id, host.clone(), phase, phase_num, stream.clone());
                group.partition = Some(partition);
                plan.groups.push(group);
            }
            plan.tasks = plan.groups.len() as u64;
        }
    }

    for group in &plan.groups {
        group.validate()?;
    }
    Ok(plan)
}

/// Every node holding any of `inputs`, in order of first appearance.
fn node_union(inputs: &[String], located: &Locations) -> Vec<String> {
    let mut nodes: Vec<String> = Vec::new();
    for key in inputs {
        for node in located.get(key).into_iter().flatten() {
            if !nodes.contains(node) {
                nodes.push(node.clone());
            }
        }
    }
    nodes
}

/// What a completed phase produced.
#[derive(Debug, Default, PartialEq)]
pub struct PhaseTally {
    /// Outputs of every successful task, in group then result order.
    /// Duplicates are kept.
    pub outputs: Vec<String>,

    /// Keys tasks chose to drop.
    pub discarded: Vec<String>,

    /// Inputs that received a result, successful or not.
    pub committed_inputs: Vec<String>,

    pub ok: u64,

    /// Failed tasks, including tasks that never reported a result.
    pub failed: u64,

    /// Tasks of done groups that never reported a result.
    pub missing: u64,

    /// The error of each failed task, by input. Tasks without a result are
    /// listed as `EJ_INTERNAL`.
    pub errors: Vec<(String, TaskError)>,
}

/// Collect the results of a phase whose groups are all done.
pub fn tally(groups: &[TaskGroup]) -> PhaseTally {
    let mut tally = PhaseTally::default();

    for group in groups {
        for result in &group.results {
            tally.committed_inputs.push(result.input.clone());
            tally.discarded.extend(result.discarded.iter().cloned());
            if result.is_ok() {
                tally.ok += 1;
                tally.outputs.extend(result.outputs.iter().cloned());
            } else {
                tally.failed += 1;
                if let Some(error) = &result.error {
                    tally.errors.push((result.input.clone(), error.clone()));
                }
            }
        }

        for label in group.unreported() {
            tally.missing += 1;
            tally.failed += 1;
            tally.errors.push((
                label,
                TaskError::new(EJ_INTERNAL, "task group finished without a result"),
            ));
        }
    }

    tally
}
