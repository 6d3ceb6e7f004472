//! The task graph
//!
//! A DAG of API-level tasks. One edge convention everywhere: an edge goes
//! from the dependent task to its dependency ("A -> B" means "A waits for
//! B"), and a task is ready when nothing it waits for remains. Topological
//! order is deterministic: insertion order is the primary key, id the
//! secondary, so two graphs built identically order identically.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::errors::GraphError;
use crate::graph::task::ApiTask;
use crate::ids::ApiId;

#[derive(Debug, Clone)]
pub struct TaskGraph {
    id: ApiId,
    name: String,
    tasks: FxHashMap<ApiId, ApiTask>,
    /// Insertion order of task ids; drives deterministic ordering
    insertion: Vec<ApiId>,
    /// dependent -> dependencies
    dependencies: FxHashMap<ApiId, Vec<ApiId>>,
}

impl TaskGraph {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        TaskGraph {
            id: ApiId::generate(&name),
            name,
            tasks: FxHashMap::default(),
            insertion: Vec::new(),
            dependencies: FxHashMap::default(),
        }
    }

    pub fn id(&self) -> &ApiId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.insertion.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insertion.is_empty()
    }

    pub fn contains(&self, id: &ApiId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn task(&self, id: &ApiId) -> Option<&ApiTask> {
        self.tasks.get(id)
    }

    /// Tasks in insertion order
    pub fn tasks(&self) -> impl Iterator<Item = &ApiTask> {
        self.insertion.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Add a task; idempotent on the task's id
    ///
    /// Returns the task's id for convenient edge wiring. Re-adding the same
    /// id is a no-op; marker-suffixed ids are rejected outright.
    pub fn add_task(&mut self, task: impl Into<ApiTask>) -> Result<ApiId, GraphError> {
        let task = task.into();
        let id = task.id().clone();

        if id.is_marker() {
            return Err(GraphError::InvalidId(
                crate::ids::ApiIdError::ReservedSuffix(id.to_string()),
            ));
        }
        if self.tasks.contains_key(&id) {
            return Ok(id);
        }

        self.insertion.push(id.clone());
        self.dependencies.insert(id.clone(), Vec::new());
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// The tasks `id` waits for
    pub fn get_dependencies(&self, id: &ApiId) -> &[ApiId] {
        static EMPTY: &[ApiId] = &[];
        self.dependencies
            .get(id)
            .map(|deps| deps.as_slice())
            .unwrap_or(EMPTY)
    }

    /// Record that `dependent` waits for `dependency`
    ///
    /// Rejected when either task is unknown or the edge would close a cycle.
    pub fn add_dependency(
        &mut self,
        dependent: &ApiId,
        dependency: &ApiId,
    ) -> Result<(), GraphError> {
        if !self.tasks.contains_key(dependent) {
            return Err(GraphError::UnknownTask(dependent.clone()));
        }
        if !self.tasks.contains_key(dependency) {
            return Err(GraphError::UnknownTask(dependency.clone()));
        }
        if dependent == dependency {
            return Err(GraphError::SelfDependency(dependent.clone()));
        }
        // A cycle closes iff the dependency already (transitively) waits on
        // the dependent
        if self.has_path(dependency, dependent) {
            return Err(GraphError::CycleDetected {
                dependent: dependent.clone(),
                dependency: dependency.clone(),
            });
        }

        let deps = self
            .dependencies
            .get_mut(dependent)
            .expect("presence checked");
        if !deps.contains(dependency) {
            deps.push(dependency.clone());
        }
        Ok(())
    }

    /// Chain tasks: each one waits for the previous
    pub fn sequence(&mut self, ids: &[ApiId]) -> Result<(), GraphError> {
        for pair in ids.windows(2) {
            self.add_dependency(&pair[1], &pair[0])?;
        }
        Ok(())
    }

    /// Fan out: every task in `ids` waits for `from`
    pub fn fan_out(&mut self, ids: &[ApiId], from: &ApiId) -> Result<(), GraphError> {
        for id in ids {
            self.add_dependency(id, from)?;
        }
        Ok(())
    }

    /// `source` waits for everything in `after`
    pub fn dependency(&mut self, source: &ApiId, after: &[ApiId]) -> Result<(), GraphError> {
        for dep in after {
            self.add_dependency(source, dep)?;
        }
        Ok(())
    }

    /// True when a dependency path leads from `from` to `to`
    pub fn has_path(&self, from: &ApiId, to: &ApiId) -> bool {
        if from == to {
            return self.tasks.contains_key(from);
        }
        let mut visited: FxHashSet<&ApiId> = FxHashSet::default();
        let mut stack: Vec<&ApiId> = vec![from];
        while let Some(current) = stack.pop() {
            if let Some(deps) = self.dependencies.get(current) {
                for dep in deps {
                    if dep == to {
                        return true;
                    }
                    if visited.insert(dep) {
                        stack.push(dep);
                    }
                }
            }
        }
        false
    }

    /// Deterministic topological order: dependencies before dependents
    ///
    /// Ties break on insertion order first, id second; identical build
    /// sequences therefore produce identical orderings. `reverse` flips the
    /// result (dependents first).
    pub fn topological_order(&self, reverse: bool) -> Vec<ApiId> {
        let position: FxHashMap<&ApiId, usize> = self
            .insertion
            .iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();

        // Remaining wait-count per task, plus reverse adjacency
        let mut waiting: FxHashMap<&ApiId, usize> = FxHashMap::default();
        let mut dependents: FxHashMap<&ApiId, Vec<&ApiId>> = FxHashMap::default();
        for id in &self.insertion {
            let deps = self.get_dependencies(id);
            waiting.insert(id, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(id);
            }
        }

        let mut ready: Vec<&ApiId> = self
            .insertion
            .iter()
            .filter(|id| waiting[*id] == 0)
            .collect();
        sort_candidates(&mut ready, &position);

        let mut order: Vec<ApiId> = Vec::with_capacity(self.insertion.len());
        while let Some(next) = ready.first().copied() {
            ready.remove(0);
            order.push(next.clone());

            if let Some(dependent_ids) = dependents.get(next) {
                let mut unblocked = Vec::new();
                for dependent in dependent_ids {
                    let count = waiting.get_mut(dependent).expect("seeded above");
                    *count -= 1;
                    if *count == 0 {
                        unblocked.push(*dependent);
                    }
                }
                ready.extend(unblocked);
                sort_candidates(&mut ready, &position);
            }
        }

        debug_assert_eq!(order.len(), self.insertion.len(), "graph must be acyclic");
        if reverse {
            order.reverse();
        }
        order
    }
}

fn sort_candidates(candidates: &mut Vec<&ApiId>, position: &FxHashMap<&ApiId, usize>) {
    candidates.sort_by(|a, b| {
        position[*a]
            .cmp(&position[*b])
            .then_with(|| a.as_str().cmp(b.as_str()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::task::StubTask;

    fn stub(graph: &mut TaskGraph, name: &str) -> ApiId {
        graph.add_task(StubTask::new(name)).unwrap()
    }

    #[test]
    fn add_task_is_idempotent_on_id() {
        let mut graph = TaskGraph::new("wf");
        let task = StubTask::new("anchor");
        let id = graph.add_task(task.clone()).unwrap();
        let again = graph.add_task(task).unwrap();
        assert_eq!(id, again);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn dependency_edges_require_known_tasks() {
        let mut graph = TaskGraph::new("wf");
        let a = stub(&mut graph, "a");
        let ghost = ApiId::new("ghost").unwrap();
        assert!(matches!(
            graph.add_dependency(&a, &ghost),
            Err(GraphError::UnknownTask(_))
        ));
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = TaskGraph::new("wf");
        let a = stub(&mut graph, "a");
        let b = stub(&mut graph, "b");
        let c = stub(&mut graph, "c");
        graph.add_dependency(&b, &a).unwrap();
        graph.add_dependency(&c, &b).unwrap();

        assert!(matches!(
            graph.add_dependency(&a, &c),
            Err(GraphError::CycleDetected { .. })
        ));
        assert!(matches!(
            graph.add_dependency(&a, &a),
            Err(GraphError::SelfDependency(_))
        ));
    }

    #[test]
    fn sequence_chains_consecutive_pairs() {
        let mut graph = TaskGraph::new("wf");
        let a = stub(&mut graph, "a");
        let b = stub(&mut graph, "b");
        let c = stub(&mut graph, "c");
        graph.sequence(&[a.clone(), b.clone(), c.clone()]).unwrap();

        assert_eq!(graph.get_dependencies(&b), &[a.clone()]);
        assert_eq!(graph.get_dependencies(&c), &[b]);
        assert!(graph.get_dependencies(&a).is_empty());
    }

    #[test]
    fn fan_out_and_dependency_helpers() {
        let mut graph = TaskGraph::new("wf");
        let root = stub(&mut graph, "root");
        let x = stub(&mut graph, "x");
        let y = stub(&mut graph, "y");
        let join = stub(&mut graph, "join");

        graph.fan_out(&[x.clone(), y.clone()], &root).unwrap();
        graph.dependency(&join, &[x.clone(), y.clone()]).unwrap();

        assert_eq!(graph.get_dependencies(&x), &[root.clone()]);
        assert_eq!(graph.get_dependencies(&join).len(), 2);
        assert!(graph.has_path(&join, &root));
        assert!(!graph.has_path(&root, &join));
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let mut graph = TaskGraph::new("wf");
        let a = stub(&mut graph, "a");
        let b = stub(&mut graph, "b");
        let c = stub(&mut graph, "c");
        graph.sequence(&[a.clone(), b.clone(), c.clone()]).unwrap();

        assert_eq!(graph.topological_order(false), vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(graph.topological_order(true), vec![c, b, a]);
    }

    #[test]
    fn topological_order_is_deterministic() {
        let build = || {
            let mut graph = TaskGraph::new("wf");
            let ids: Vec<ApiId> = ["d", "b", "a", "c"]
                .iter()
                .map(|name| {
                    graph
                        .add_task(StubTask {
                            id: ApiId::new(*name).unwrap(),
                            name: name.to_string(),
                        })
                        .unwrap()
                })
                .collect();
            graph.add_dependency(&ids[3], &ids[1]).unwrap();
            graph
        };

        let first = build().topological_order(false);
        let second = build().topological_order(false);
        assert_eq!(first, second);
        // Independent tasks keep insertion order
        assert_eq!(first[0].as_str(), "d");
        assert_eq!(first[1].as_str(), "b");
    }

    #[test]
    fn marker_ids_cannot_be_added_as_tasks() {
        let mut graph = TaskGraph::new("wf");
        let sneaky = StubTask {
            id: ApiId::new("wf2").unwrap().end_marker(),
            name: "sneaky".to_string(),
        };
        assert!(graph.add_task(sneaky).is_err());
    }
}
