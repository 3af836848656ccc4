use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::cycle_check::{find_cycle, topological_order};
use crate::flow::{Flow, Node};
use crate::task::{IntoTaskIds, Task, TaskId};
use crate::CompileError;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Append-only builder for a flow.
///
/// Dependencies may only name handles returned by earlier [`Graph::add`]
/// calls on the same graph; [`Graph::compile`] rejects anything else.
#[derive(Debug)]
pub struct Graph {
    id: u64,
    name: String,
    tasks: Vec<Task>,
    foreign: Vec<TaskId>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            tasks: Vec::new(),
            foreign: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn add(&mut self, task: Task) -> TaskId {
        let id = TaskId::new(self.id, self.tasks.len());
        self.tasks.push(task);
        id
    }

    /// Extends the dependency set of a task that was already added.
    pub fn add_dependencies(&mut self, task: TaskId, ids: impl IntoTaskIds) -> &mut Self {
        match self.owned(task) {
            Some(index) => self.tasks[index].dependencies.extend_from(ids),
            None => self.foreign.push(task),
        }
        self
    }

    fn owned(&self, id: TaskId) -> Option<usize> {
        (id.graph() == self.id && id.index() < self.tasks.len()).then_some(id.index())
    }

    /// Validates the graph and freezes it into an executable [`Flow`].
    pub fn compile(self) -> Result<Flow, CompileError> {
        if let Some(&task) = self.foreign.first() {
            return Err(CompileError::UnknownTask {
                flow: self.name,
                task,
            });
        }

        let mut dependencies = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let mut deps = Vec::with_capacity(task.dependencies.len());
            for dep in task.dependencies.iter() {
                match self.owned(dep) {
                    Some(index) => deps.push(index),
                    None => {
                        return Err(CompileError::UnknownDependency {
                            flow: self.name.clone(),
                            task: task.name.clone(),
                            dependency: dep,
                        });
                    }
                }
            }
            dependencies.push(deps);
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            return Err(CompileError::CircularDependency {
                path: cycle
                    .into_iter()
                    .map(|index| self.tasks[index].name.clone())
                    .collect(),
                flow: self.name,
            });
        }

        let mut dependents = vec![Vec::new(); self.tasks.len()];
        for (index, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(index);
            }
        }
        let order = topological_order(&dependencies, &dependents);

        debug!(flow = %self.name, tasks = self.tasks.len(), "compiled flow");

        let nodes = self
            .tasks
            .into_iter()
            .zip(dependencies)
            .enumerate()
            .map(|(index, (task, dependencies))| Node {
                id: TaskId::new(self.id, index),
                task,
                dependencies,
            })
            .collect();

        Ok(Flow::new(self.name, nodes, dependents, order))
    }
}
