//! Dependency graph between pending tasks of one owner.
//!
//! Design:
//! - Forward edges: task -> unfinished tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync
//! - A succeeded dependency is simply removed; a task with no forward edges is unblocked.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::domain::TaskId;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on (waits for)
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it (waiting tasks)
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency: `task` depends on `depends_on` ("B waits for A").
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    /// Remove a dependency: `task` no longer depends on `depends_on`.
    pub fn remove_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        if let Entry::Occupied(mut e) = self.edges.entry(task) {
            e.get_mut().remove(&depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on) {
            e.get_mut().remove(&task);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// Drops `task` from the graph in both directions.
    ///
    /// Returns the tasks that were waiting for it (they may still have other dependencies).
    pub fn remove_task(&mut self, task: TaskId) -> Vec<TaskId> {
        for dep in self.get_dependencies(task) {
            self.remove_dependency(task, dep);
        }
        let waiting = self.get_waiting_tasks(task);
        for waiter in &waiting {
            self.remove_dependency(*waiter, task);
        }
        waiting
    }

    /// Tasks that were waiting for `task`.
    pub fn get_waiting_tasks(&self, task: TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&task)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_dependencies(&self, task: TaskId) -> bool {
        self.edges.get(&task).is_some_and(|deps| !deps.is_empty())
    }

    pub fn get_dependencies(&self, task: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Detect a cycle in the dependency graph.
    ///
    /// 3 色 DFS（White / Gray / Black）。Gray のノードに戻ってきたら cycle。
    /// Returns the first cycle found as a path `[a, b, ..., a]`, or None for a DAG.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut colors = HashMap::new();
        let mut starts: Vec<TaskId> = self.edges.keys().copied().collect();
        // HashMap の順序に依存しないように
        starts.sort();
        for start in starts {
            if colors.contains_key(&start) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = self.dfs_cycle(start, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: TaskId,
        colors: &mut HashMap<TaskId, Color>,
        path: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        let mut deps = self.get_dependencies(node);
        deps.sort();
        for dep in deps {
            match colors.get(&dep) {
                Some(Color::Gray) => {
                    let start = path.iter().position(|t| *t == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Some(Color::Black) => {}
                None => {
                    if let Some(cycle) = self.dfs_cycle(dep, colors, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        colors.insert(node, Color::Black);
        path.pop();
        None
    }
}
