//! Dependency graph and wave layering.
//!
//! A wave is a set of tasks whose in-batch dependencies all sit in earlier
//! waves. Dependencies on ids outside the batch are treated as already
//! satisfied and dropped.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::Result;

use crate::core::types::Task;
use crate::error::OrchestratorError;

/// Mapping from task id to the set of in-batch ids it depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build the graph for a batch. Duplicate ids are a configuration error.
    pub fn build(tasks: &[Task]) -> Result<Self> {
        let mut ids = HashSet::with_capacity(tasks.len());
        for task in tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(OrchestratorError::DuplicateTask {
                    id: task.id.clone(),
                }
                .into());
            }
        }

        let edges = tasks
            .iter()
            .map(|task| {
                let deps = task
                    .depends_on
                    .iter()
                    .filter(|dep| ids.contains(dep.as_str()) && **dep != task.id)
                    .cloned()
                    .collect();
                (task.id.clone(), deps)
            })
            .collect();
        Ok(Self { edges })
    }

    pub fn dependencies(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.edges.get(id)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Ids that depend, directly or transitively, on `id`.
    pub fn dependents_of(&self, id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for (task, deps) in &self.edges {
                if deps.contains(&current) && found.insert(task.clone()) {
                    frontier.push(task.clone());
                }
            }
        }
        found
    }
}

/// Layer tasks into execution waves (Kahn's algorithm).
///
/// Tasks keep their input order within a wave. A cycle yields
/// `OrchestratorError::DependencyCycle` naming every unresolved task.
pub fn execution_waves(tasks: &[Task]) -> Result<Vec<Vec<Task>>> {
    let graph = DependencyGraph::build(tasks)?;
    let mut done: HashSet<&str> = HashSet::with_capacity(tasks.len());
    let mut remaining: Vec<&Task> = tasks.iter().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&Task>, Vec<&Task>) =
            remaining.into_iter().partition(|task| {
                graph
                    .dependencies(&task.id)
                    .is_none_or(|deps| deps.iter().all(|dep| done.contains(dep.as_str())))
            });

        if ready.is_empty() {
            let mut tasks: Vec<String> = blocked.iter().map(|task| task.id.clone()).collect();
            tasks.sort();
            return Err(OrchestratorError::DependencyCycle { tasks }.into());
        }

        for task in &ready {
            done.insert(task.id.as_str());
        }
        waves.push(ready.into_iter().cloned().collect());
        remaining = blocked;
    }

    Ok(waves)
}
