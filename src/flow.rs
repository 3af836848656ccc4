use std::fmt::Write as _;

use crate::executor::{self, RunOptions, RunReport};
use crate::task::{Task, TaskId};
use crate::FlowError;

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) id: TaskId,
    pub(crate) task: Task,
    pub(crate) dependencies: Vec<usize>,
}

/// A validated, immutable task graph, ready to run any number of times.
#[derive(Debug)]
pub struct Flow {
    name: String,
    nodes: Vec<Node>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl Flow {
    pub(crate) fn new(
        name: String,
        nodes: Vec<Node>,
        dependents: Vec<Vec<usize>>,
        order: Vec<usize>,
    ) -> Self {
        Self {
            name,
            nodes,
            dependents,
            order,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn dependents_of(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    fn index_of(&self, id: TaskId) -> Option<usize> {
        self.nodes
            .get(id.index())
            .filter(|node| node.id == id)
            .map(|_| id.index())
    }

    pub fn task_name(&self, id: TaskId) -> Option<&str> {
        self.index_of(id).map(|i| self.nodes[i].task.name())
    }

    pub fn dependencies(&self, id: TaskId) -> Vec<TaskId> {
        self.index_of(id)
            .map(|i| {
                self.nodes[i]
                    .dependencies
                    .iter()
                    .map(|&dep| self.nodes[dep].id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn dependents(&self, id: TaskId) -> Vec<TaskId> {
        self.index_of(id)
            .map(|i| self.dependents[i].iter().map(|&d| self.nodes[d].id).collect())
            .unwrap_or_default()
    }

    pub fn topological_order(&self) -> Vec<TaskId> {
        self.order.iter().map(|&i| self.nodes[i].id).collect()
    }

    /// Renders every root task followed by the chains of tasks waiting on it.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.name);

        for (index, node) in self.nodes.iter().enumerate() {
            if node.dependencies.is_empty() {
                let _ = writeln!(out, "{}", node.task.name());
                self.render_chain(&mut out, index, "  ");
            }
        }

        out
    }

    fn render_chain(&self, out: &mut String, index: usize, prefix: &str) {
        for &child in &self.dependents[index] {
            let _ = writeln!(out, "{}└─> {}", prefix, self.nodes[child].task.name());
            self.render_chain(out, child, &format!("{prefix}    "));
        }
    }

    /// Runs the flow and returns the per-task report.
    pub async fn execute(&self, opts: RunOptions) -> RunReport {
        executor::execute(self, opts).await
    }

    /// Runs the flow; `Ok` only if no task failed and the run was not
    /// canceled.
    pub async fn run(&self, opts: RunOptions) -> Result<(), FlowError> {
        self.execute(opts).await.into_result()
    }
}
