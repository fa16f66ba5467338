//! Execution planning: compile a workflow definition into a layered
//! plan.
//!
//! Dependencies come from two places: explicit `dependsOn` entries and
//! implicit references mined from `{{tasks.X...}}` templates in task
//! inputs. The two sets are unioned; duplicates collapse silently.
//! Layers are the longest-path level assignment (leaves at layer 0, a
//! task one past its deepest predecessor) and exist for planning and
//! trace purposes; runtime readiness is edge-driven.

use crate::template;
use crate::workflow::WorkflowDefinition;
use petgraph::graph::{DiGraph, NodeIndex};
use snafu::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Duplicate task id '{id}'"))]
    DuplicateTaskId { id: String },

    #[snafu(display("Task '{task}' depends on unknown task '{dependency}'"))]
    UnknownDependency { task: String, dependency: String },

    #[snafu(display("Cyclic dependency: {cycle}"))]
    CyclicDependency { cycle: String },

    #[snafu(display("Invalid template in task '{task}': {source}"))]
    InvalidTemplate {
        task: String,
        source: template::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Immutable plan derived from a workflow definition.
///
/// Tasks are stored in a dense arena in authoring order; edges are two
/// parallel adjacency arrays over those indices. The string-keyed maps
/// exist for the external surface (trace, context) only.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub task_ids: Vec<String>,
    pub index_of: HashMap<String, usize>,
    pub preds_of: Vec<Vec<usize>>,
    pub succs_of: Vec<Vec<usize>>,
    /// Topological levels: every task's transitive predecessors live in
    /// strictly earlier layers. Ids within a layer are sorted for
    /// determinism.
    pub layers: Vec<Vec<String>>,
    pub id_to_layer: HashMap<String, usize>,
}

impl ExecutionPlan {
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.task_ids.len()
    }

    #[must_use]
    pub fn layer_of(&self, task_id: &str) -> Option<usize> {
        self.id_to_layer.get(task_id).copied()
    }
}

/// Compile a workflow into an execution plan.
pub fn plan(workflow: &WorkflowDefinition) -> Result<ExecutionPlan> {
    let mut index_of: HashMap<String, usize> = HashMap::new();
    let mut task_ids = Vec::with_capacity(workflow.tasks.len());
    for task in &workflow.tasks {
        if index_of.insert(task.id.clone(), task_ids.len()).is_some() {
            return Err(Error::DuplicateTaskId {
                id: task.id.clone(),
            });
        }
        task_ids.push(task.id.clone());
    }

    // Explicit dependsOn edges unioned with implicit template edges.
    let mut edges: HashSet<(usize, usize)> = HashSet::new();
    for (idx, task) in workflow.tasks.iter().enumerate() {
        for dependency in &task.depends_on {
            let dep_idx = *index_of
                .get(dependency)
                .ok_or_else(|| Error::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dependency.clone(),
                })?;
            edges.insert((dep_idx, idx));
        }

        let input_doc = serde_json::Value::Object(
            task.input
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let paths = template::scan_value(&input_doc).context(InvalidTemplateSnafu {
            task: task.id.clone(),
        })?;
        for path in paths {
            if let Some(referenced) = path.referenced_task() {
                let dep_idx =
                    *index_of
                        .get(referenced)
                        .ok_or_else(|| Error::UnknownDependency {
                            task: task.id.clone(),
                            dependency: referenced.to_string(),
                        })?;
                edges.insert((dep_idx, idx));
            }
        }
    }

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..task_ids.len()).map(|i| graph.add_node(i)).collect();
    for &(from, to) in &edges {
        graph.add_edge(nodes[from], nodes[to], ());
    }

    // Flatten the graph into parallel adjacency arrays over the dense
    // task indices; these are what the scheduler walks at runtime.
    let mut preds_of = vec![Vec::new(); task_ids.len()];
    let mut succs_of = vec![Vec::new(); task_ids.len()];
    for (idx, &node) in nodes.iter().enumerate() {
        preds_of[idx] = graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .map(|n| graph[n])
            .collect();
        succs_of[idx] = graph
            .neighbors_directed(node, petgraph::Direction::Outgoing)
            .map(|n| graph[n])
            .collect();
    }
    for list in preds_of.iter_mut().chain(succs_of.iter_mut()) {
        list.sort_unstable();
    }

    detect_cycle(&task_ids, &succs_of)?;

    // Kahn traversal assigning each node one level past its deepest
    // predecessor.
    let mut indegree: Vec<usize> = preds_of.iter().map(Vec::len).collect();
    let mut level = vec![0usize; task_ids.len()];
    let mut queue: VecDeque<usize> = (0..task_ids.len()).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0usize;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &succ in &succs_of[node] {
            level[succ] = level[succ].max(level[node] + 1);
            indegree[succ] -= 1;
            if indegree[succ] == 0 {
                queue.push_back(succ);
            }
        }
    }
    debug_assert_eq!(visited, task_ids.len());

    let layer_count = level.iter().copied().max().map(|m| m + 1).unwrap_or(0);
    let mut layers: Vec<Vec<String>> = vec![Vec::new(); layer_count];
    for (idx, &lvl) in level.iter().enumerate() {
        layers[lvl].push(task_ids[idx].clone());
    }
    for layer in &mut layers {
        layer.sort();
    }
    let id_to_layer = level
        .iter()
        .enumerate()
        .map(|(idx, &lvl)| (task_ids[idx].clone(), lvl))
        .collect();

    Ok(ExecutionPlan {
        task_ids,
        index_of,
        preds_of,
        succs_of,
        layers,
        id_to_layer,
    })
}

/// Depth-first search with an on-stack set; a back edge is a cycle,
/// reported as the offending path.
fn detect_cycle(task_ids: &[String], succs_of: &[Vec<usize>]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    let mut marks = vec![Mark::White; task_ids.len()];
    let mut stack: Vec<usize> = Vec::new();

    fn visit(
        node: usize,
        task_ids: &[String],
        succs_of: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Result<()> {
        marks[node] = Mark::Grey;
        stack.push(node);
        for &succ in &succs_of[node] {
            match marks[succ] {
                Mark::Grey => {
                    let start = stack.iter().position(|&n| n == succ).unwrap_or(0);
                    let mut names: Vec<&str> =
                        stack[start..].iter().map(|&n| task_ids[n].as_str()).collect();
                    names.push(task_ids[succ].as_str());
                    return Err(Error::CyclicDependency {
                        cycle: names.join(" -> "),
                    });
                }
                Mark::White => visit(succ, task_ids, succs_of, marks, stack)?,
                Mark::Black => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Black;
        Ok(())
    }

    for node in 0..task_ids.len() {
        if marks[node] == Mark::White {
            visit(node, task_ids, succs_of, &mut marks, &mut stack)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::TaskRef;
    use indexmap::IndexMap;
    use serde_json::json;

    fn task(id: &str, depends_on: &[&str]) -> TaskRef {
        TaskRef {
            id: id.to_string(),
            task_ref: "noop".to_string(),
            input: IndexMap::new(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            timeout: None,
            retry: None,
            continue_on_failure: false,
        }
    }

    fn workflow(tasks: Vec<TaskRef>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "test".to_string(),
            namespace: "default".to_string(),
            input: None,
            tasks,
            output: IndexMap::new(),
            timeout: None,
        }
    }

    #[test]
    fn test_diamond_layers() {
        let wf = workflow(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ]);
        let plan = plan(&wf).unwrap();
        assert_eq!(
            plan.layers,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()]
            ]
        );
        assert_eq!(plan.layer_of("d"), Some(2));
    }

    #[test]
    fn test_every_dependency_is_in_an_earlier_layer() {
        let wf = workflow(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a", "b"]),
            task("d", &["a"]),
            task("e", &["c", "d"]),
        ]);
        let plan = plan(&wf).unwrap();
        for (idx, preds) in plan.preds_of.iter().enumerate() {
            let my_layer = plan.id_to_layer[&plan.task_ids[idx]];
            for &p in preds {
                let pred_layer = plan.id_to_layer[&plan.task_ids[p]];
                assert!(pred_layer < my_layer);
            }
        }
    }

    #[test]
    fn test_implicit_template_dependency_is_unioned() {
        let mut fetch = task("fetch", &[]);
        fetch.input.insert("userId".to_string(), json!(1));
        let mut greet = task("greet", &["fetch"]);
        greet.input.insert(
            "name".to_string(),
            json!("{{tasks.fetch.output.name}}"),
        );
        let mut audit = task("audit", &[]);
        audit.input.insert(
            "summary".to_string(),
            json!("{{tasks.greet.output.message}}"),
        );

        let plan = plan(&workflow(vec![fetch, greet, audit])).unwrap();
        // The explicit fetch->greet edge and the implicit greet->audit
        // edge coexist; the duplicate fetch->greet reference collapses.
        assert_eq!(plan.layer_of("fetch"), Some(0));
        assert_eq!(plan.layer_of("greet"), Some(1));
        assert_eq!(plan.layer_of("audit"), Some(2));
        assert_eq!(plan.preds_of[plan.index_of["greet"]], vec![0]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let wf = workflow(vec![task("a", &[]), task("a", &[])]);
        assert!(matches!(
            plan(&wf),
            Err(Error::DuplicateTaskId { id }) if id == "a"
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let wf = workflow(vec![task("a", &["ghost"])]);
        assert!(matches!(
            plan(&wf),
            Err(Error::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn test_unknown_implicit_dependency_rejected() {
        let mut a = task("a", &[]);
        a.input
            .insert("v".to_string(), json!("{{tasks.ghost.output}}"));
        assert!(matches!(
            plan(&workflow(vec![a])),
            Err(Error::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn test_cycle_reported_with_path() {
        let wf = workflow(vec![
            task("a", &["c"]),
            task("b", &["a"]),
            task("c", &["b"]),
        ]);
        match plan(&wf) {
            Err(Error::CyclicDependency { cycle }) => {
                assert!(cycle.contains("->"), "cycle path missing: {cycle}");
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let wf = workflow(vec![task("a", &["a"])]);
        assert!(matches!(plan(&wf), Err(Error::CyclicDependency { .. })));
    }

    #[test]
    fn test_empty_workflow_plans_to_no_layers() {
        let plan = plan(&workflow(Vec::new())).unwrap();
        assert_eq!(plan.task_count(), 0);
        assert!(plan.layers.is_empty());
    }
}
