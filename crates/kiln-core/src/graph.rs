//! Dependency Graph - ordering constraints between tasks
//!
//! Three edge sources are unioned into `run_after`:
//! - file overlap inside a group (producer before reader)
//! - precedence declarations of action kinds, compared per bucket
//! - modify chains over the whole build
//!
//! Groups are then ordered with Kahn's algorithm; petgraph names the cycle
//! members when a group cannot be fully ordered.

use petgraph::algo::tarjan_scc;
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::action::Precedence;
use crate::artifact::Artifact;
use crate::build::Build;
use crate::error::{EngineError, Result};
use crate::task::TaskId;

/// Build every ordering edge; runs once, before the first group is handed out
pub(crate) fn prepare(build: &mut Build) -> Result<()> {
    let groups: Vec<Vec<TaskId>> = build.groups().to_vec();
    for group in &groups {
        file_edges(build, group);
        precedence_edges(build, group)?;
    }
    modify_chains(build)?;
    Ok(())
}

fn add_edge(build: &mut Build, before: TaskId, after: TaskId) {
    if before != after {
        build.task_mut(after).run_after.insert(before);
    }
}

fn file_edges(build: &mut Build, group: &[TaskId]) {
    let mut producers: HashMap<Artifact, Vec<TaskId>> = HashMap::new();
    for id in group {
        for output in &build.task(*id).outputs {
            producers.entry(output.clone()).or_default().push(*id);
        }
    }

    let mut edges = Vec::new();
    for id in group {
        for artifact in build.task(*id).explicit_deps() {
            if build.is_modify_target(artifact) {
                continue;
            }
            for producer in producers.get(artifact).into_iter().flatten() {
                edges.push((*producer, *id));
            }
        }
    }
    for (before, after) in edges {
        add_edge(build, before, after);
    }
}

/// True when `a` must precede `b`
fn precedes(a_kind: &str, a: &Precedence, b_kind: &str, b: &Precedence) -> bool {
    b.consumes.iter().any(|k| a.produces.contains(k))
        || a.before.iter().any(|k| k == b_kind)
        || b.after.iter().any(|k| k == a_kind)
}

fn precedence_edges(build: &mut Build, group: &[TaskId]) -> Result<()> {
    // one bucket per action kind; only the declarations are compared
    let mut buckets: BTreeMap<String, (Precedence, Vec<TaskId>)> = BTreeMap::new();
    for id in group {
        let kind = &build.task(*id).kind;
        if kind.precedence.is_empty() {
            continue;
        }
        buckets
            .entry(kind.name.clone())
            .or_insert_with(|| (kind.precedence.clone(), Vec::new()))
            .1
            .push(*id);
    }

    let buckets: Vec<(String, Precedence, Vec<TaskId>)> = buckets
        .into_iter()
        .map(|(name, (precedence, ids))| (name, precedence, ids))
        .collect();
    let mut edges = Vec::new();
    for (i, (a, pa, a_ids)) in buckets.iter().enumerate() {
        for (b, pb, b_ids) in &buckets[i + 1..] {
            match (precedes(a, pa, b, pb), precedes(b, pb, a, pa)) {
                (true, true) => return Err(EngineError::PrecedenceConflict(a.clone(), b.clone())),
                (true, false) => edges.push((a_ids, b_ids)),
                (false, true) => edges.push((b_ids, a_ids)),
                (false, false) => {}
            }
        }
    }

    let edges: Vec<(TaskId, TaskId)> = edges
        .into_iter()
        .flat_map(|(before, after)| {
            before
                .iter()
                .flat_map(move |x| after.iter().map(move |y| (*x, *y)))
        })
        .collect();
    for (before, after) in edges {
        add_edge(build, before, after);
    }
    Ok(())
}

/// `from` depends on `target`, directly or transitively
fn runs_after(build: &Build, from: TaskId, target: TaskId) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![from];
    while let Some(id) = stack.pop() {
        for pred in &build.task(id).run_after {
            if *pred == target {
                return true;
            }
            if seen.insert(*pred) {
                stack.push(*pred);
            }
        }
    }
    false
}

/// Chain of each modified target: the producer, then every step in order
fn chains(build: &Build) -> Result<BTreeMap<Artifact, Vec<TaskId>>> {
    let mut steps: BTreeMap<Artifact, Vec<TaskId>> = BTreeMap::new();
    for task in build.tasks() {
        if let Some(target) = &task.modifies {
            steps.entry(target.clone()).or_default().push(task.id);
        }
    }

    let mut chains = BTreeMap::new();
    for (target, mut ids) in steps {
        // stable: declaration order within late and non-late steps
        ids.sort_by_key(|id| build.task(*id).late);
        let Some(producer) = build.producers_of(&target).first().copied() else {
            return Err(EngineError::Configuration(format!(
                "'{}' is modified but no task produces it",
                target
            )));
        };
        let mut chain = vec![producer];
        chain.extend(ids);
        chains.insert(target, chain);
    }
    Ok(chains)
}

fn modify_chains(build: &mut Build) -> Result<()> {
    let chains = chains(build)?;

    for (target, chain) in &chains {
        for pair in chain.windows(2) {
            add_edge(build, pair[0], pair[1]);
            let step = build.task_mut(pair[1]);
            step.sig_deps.push(pair[0]);
            step.chain_prev = Some(pair[0]);
        }
        if let Some(last) = chain.last() {
            build.task_mut(*last).chain_last = true;
        }
        debug!(
            "modify chain of {}: {}",
            target,
            chain
                .iter()
                .map(|id| build.task(*id).label.clone())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
    }

    for (target, chain) in &chains {
        let readers: Vec<TaskId> = build
            .tasks()
            .iter()
            .filter(|t| !chain.contains(&t.id) && t.explicit_deps().any(|a| a == target))
            .map(|t| t.id)
            .collect();
        for reader in readers {
            let attach = attach_point(build, chain, reader);
            add_edge(build, attach, reader);
            build.task_mut(reader).sig_deps.push(attach);
        }
    }
    Ok(())
}

/// Latest chain entry that does not already depend on `reader`
fn attach_point(build: &Build, chain: &[TaskId], reader: TaskId) -> TaskId {
    let first_dependent = chain
        .iter()
        .skip(1)
        .position(|step| *step == reader || runs_after(build, *step, reader))
        .map(|i| i + 1);
    match first_dependent {
        Some(i) => chain[i - 1],
        None => chain[chain.len() - 1],
    }
}

/// Entry a reader of `artifact` should follow: the last chain step, else the producer
fn current_writer(build: &Build, artifact: &Artifact) -> Option<TaskId> {
    if build.is_modify_target(artifact) {
        if let Some(last) = build
            .tasks()
            .iter()
            .find(|t| t.chain_last && t.modifies.as_ref() == Some(artifact))
        {
            return Some(last.id);
        }
    }
    build.producers_of(artifact).first().copied()
}

/// Link tasks injected at run time to the producers and readers already known
pub(crate) fn link_injected(build: &mut Build, ids: &[TaskId]) {
    let mut edges = Vec::new();
    for id in ids {
        let task = build.task(*id);
        for artifact in task.explicit_deps() {
            if let Some(writer) = current_writer(build, artifact) {
                edges.push((writer, *id, build.is_modify_target(artifact)));
            }
        }
        for output in &task.outputs {
            for reader in build.tasks() {
                if reader.id != *id
                    && reader.state == crate::task::TaskState::NotRun
                    && reader.explicit_deps().any(|a| a == output)
                {
                    edges.push((*id, reader.id, false));
                }
            }
        }
    }
    for (before, after, sig) in edges {
        add_edge(build, before, after);
        if sig {
            build.task_mut(after).sig_deps.push(before);
        }
    }
}

/// Order one group: predecessors first, declaration order among ready tasks
pub(crate) fn topo_sort(build: &Build, group: &[TaskId]) -> Result<Vec<TaskId>> {
    let members: HashSet<TaskId> = group.iter().copied().collect();
    let mut in_degree: HashMap<TaskId, usize> = HashMap::new();
    let mut successors: HashMap<TaskId, Vec<TaskId>> = HashMap::new();

    for id in group {
        let preds: Vec<TaskId> = build
            .task(*id)
            .run_after
            .iter()
            .filter(|p| members.contains(p))
            .copied()
            .collect();
        in_degree.insert(*id, preds.len());
        for pred in preds {
            successors.entry(pred).or_default().push(*id);
        }
    }

    let mut queue: VecDeque<TaskId> = group
        .iter()
        .filter(|id| in_degree[*id] == 0)
        .copied()
        .collect();
    let mut order = Vec::with_capacity(group.len());

    while let Some(id) = queue.pop_front() {
        order.push(id);
        for succ in successors.get(&id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(succ) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*succ);
                }
            }
        }
    }

    if order.len() < group.len() {
        let remaining: Vec<TaskId> = group
            .iter()
            .filter(|id| in_degree[*id] > 0)
            .copied()
            .collect();
        return Err(EngineError::Cycle(cycle_members(build, &remaining)));
    }
    Ok(order)
}

/// Labels of the tasks that sit on a cycle
fn cycle_members(build: &Build, remaining: &[TaskId]) -> Vec<String> {
    let mut graph: DiGraph<TaskId, ()> = DiGraph::new();
    let mut index: HashMap<TaskId, NodeIndex> = HashMap::new();
    for id in remaining {
        index.insert(*id, graph.add_node(*id));
    }
    for id in remaining {
        for pred in &build.task(*id).run_after {
            if let Some(from) = index.get(pred) {
                graph.add_edge(*from, index[id], ());
            }
        }
    }

    let mut names: Vec<String> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(|node| build.task(graph[node]).label.clone())
        .collect();
    if names.is_empty() {
        names = remaining
            .iter()
            .map(|id| build.task(*id).label.clone())
            .collect();
    }
    names.sort();
    names
}

/// Graphviz rendering of every task and its `run_after` edges
pub fn to_dot(build: &Build) -> String {
    let mut graph: DiGraph<String, &str> = DiGraph::new();
    let nodes: Vec<NodeIndex> = build
        .tasks()
        .iter()
        .map(|t| graph.add_node(t.label.clone()))
        .collect();
    for task in build.tasks() {
        for pred in &task.run_after {
            graph.add_edge(nodes[pred.0], nodes[task.id.0], "");
        }
    }
    format!("{}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
}
