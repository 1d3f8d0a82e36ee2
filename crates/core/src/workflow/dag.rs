use crate::error::StructuralError;
use crate::types::StepDefinition;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Validated DAG of workflow steps
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<Arc<StepDefinition>, ()>,
    step_indices: HashMap<String, NodeIndex>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl WorkflowDag {
    /// Build and validate a DAG from step definitions.
    ///
    /// Fails on duplicate names, dependencies that name no step, and cycles.
    pub fn build(steps: Vec<StepDefinition>) -> Result<Self, StructuralError> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        for mut step in steps {
            let mut seen = HashSet::new();
            step.dependencies.retain(|d| seen.insert(d.clone()));

            let name = step.name.clone();
            if step_indices.contains_key(&name) {
                return Err(StructuralError::DuplicateStep { name });
            }
            let node = graph.add_node(Arc::new(step));
            step_indices.insert(name, node);
        }

        let mut edges = Vec::new();
        for node in graph.node_indices() {
            let step = &graph[node];
            for dep in &step.dependencies {
                let dep_idx = step_indices.get(dep).ok_or_else(|| {
                    StructuralError::MissingDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                // Edge from dependency to dependent (dep -> step)
                edges.push((*dep_idx, node));
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        let dag = Self {
            graph,
            step_indices,
        };
        dag.check_acyclic()?;

        Ok(dag)
    }

    /// Three-color DFS along dependency edges; reports the first cycle found.
    ///
    /// Each stack frame holds a node and the index of its next dependency to
    /// examine, so chain length is bounded by heap, not by the thread stack.
    fn check_acyclic(&self) -> Result<(), StructuralError> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut stack: Vec<(NodeIndex, usize)> = Vec::new();

        for start in self.graph.node_indices() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }
            marks[start.index()] = Mark::InProgress;
            stack.push((start, 0));

            while let Some((node, next)) = stack.last_mut() {
                let node = *node;
                let Some(dep) = self.graph[node].dependencies.get(*next) else {
                    marks[node.index()] = Mark::Done;
                    stack.pop();
                    continue;
                };
                *next += 1;

                let dep_idx = self.step_indices[dep];
                match marks[dep_idx.index()] {
                    Mark::Done => {}
                    Mark::Unvisited => {
                        marks[dep_idx.index()] = Mark::InProgress;
                        stack.push((dep_idx, 0));
                    }
                    Mark::InProgress => {
                        let from = stack
                            .iter()
                            .position(|(n, _)| *n == dep_idx)
                            .unwrap_or(0);
                        let mut cycle: Vec<String> = stack[from..]
                            .iter()
                            .map(|(n, _)| self.graph[*n].name.clone())
                            .collect();
                        cycle.push(self.graph[dep_idx].name.clone());
                        return Err(StructuralError::Cycle { path: cycle });
                    }
                }
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn step(&self, name: &str) -> Option<&Arc<StepDefinition>> {
        self.step_indices.get(name).map(|idx| &self.graph[*idx])
    }

    /// All steps in definition order
    pub fn steps(&self) -> impl Iterator<Item = &Arc<StepDefinition>> {
        self.graph.node_indices().map(move |n| &self.graph[n])
    }

    /// Get steps in topological order (dependencies first)
    pub fn topological_order(&self) -> Vec<Arc<StepDefinition>> {
        let mut topo = Topo::new(&self.graph);
        let mut steps = Vec::new();

        while let Some(node) = topo.next(&self.graph) {
            steps.push(self.graph[node].clone());
        }

        steps
    }

    /// Steps that depend directly on the given step
    pub fn dependents(&self, name: &str) -> Vec<String> {
        let Some(node) = self.step_indices.get(name) else {
            return Vec::new();
        };

        let mut deps: Vec<String> = self
            .graph
            .neighbors_directed(*node, Direction::Outgoing)
            .map(|n| self.graph[n].name.clone())
            .collect();
        deps.sort();
        deps
    }

    /// Steps nothing depends on
    pub fn sink_steps(&self) -> Vec<String> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n].name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition::new(name).depends_on(deps.iter().copied())
    }

    #[test]
    fn test_linear_dag() {
        let dag = WorkflowDag::build(vec![
            step("step3", &["step2"]),
            step("step1", &[]),
            step("step2", &["step1"]),
        ])
        .unwrap();

        let order: Vec<String> = dag
            .topological_order()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(order, vec!["step1", "step2", "step3"]);
        assert_eq!(dag.sink_steps(), vec!["step3".to_string()]);
    }

    #[test]
    fn test_diamond_dag() {
        let dag = WorkflowDag::build(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c", "b"]),
        ])
        .unwrap();

        assert_eq!(dag.len(), 4);
        assert_eq!(dag.dependents("a"), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(dag.step("d").unwrap().dependencies, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let err = WorkflowDag::build(vec![step("a", &[]), step("b", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            StructuralError::MissingDependency {
                step: "b".to_string(),
                dependency: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let err = WorkflowDag::build(vec![step("a", &[]), step("a", &[])]).unwrap_err();
        assert!(matches!(err, StructuralError::DuplicateStep { .. }));
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = WorkflowDag::build(vec![
            step("entry", &[]),
            step("a", &["entry", "c"]),
            step("b", &["a"]),
            step("c", &["b"]),
        ])
        .unwrap_err();

        match err {
            StructuralError::Cycle { path } => {
                assert_eq!(path, vec!["a", "c", "b", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = WorkflowDag::build(vec![step("loop", &["loop"])]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "dependency cycle detected: loop -> loop"
        );
    }

    #[test]
    fn test_long_chain_builds() {
        let mut steps = vec![step("s0", &[])];
        for i in 1..10_000 {
            let prev = format!("s{}", i - 1);
            steps.push(step(&format!("s{i}"), &[prev.as_str()]));
        }
        steps.reverse();

        let dag = WorkflowDag::build(steps).unwrap();
        assert_eq!(dag.len(), 10_000);

        let order = dag.topological_order();
        assert_eq!(order.first().unwrap().name, "s0");
        assert_eq!(order.last().unwrap().name, "s9999");
    }

    #[test]
    fn test_long_cycle_reports_full_path() {
        let mut steps = vec![step("s0", &["s4999"])];
        for i in 1..5_000 {
            let prev = format!("s{}", i - 1);
            steps.push(step(&format!("s{i}"), &[prev.as_str()]));
        }

        match WorkflowDag::build(steps).unwrap_err() {
            StructuralError::Cycle { path } => {
                assert_eq!(path.len(), 5_001);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_dag() {
        let dag = WorkflowDag::build(Vec::new()).unwrap();
        assert!(dag.is_empty());
        assert!(dag.topological_order().is_empty());
    }
}
