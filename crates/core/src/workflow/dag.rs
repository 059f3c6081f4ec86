use crate::definition::WorkflowDefinition;
use crate::error::EngineError;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Validate a workflow's dependency graph and produce its execution
/// layers: every step in layer i may run in parallel, and all of layer
/// i completes before layer i+1 starts. Step order within a layer is
/// unspecified.
pub fn plan(defn: &WorkflowDefinition) -> Result<Vec<Vec<String>>, EngineError> {
    for (step_id, step) in &defn.steps {
        for dep in &step.depends_on {
            if !defn.steps.contains_key(dep) {
                return Err(EngineError::MissingDependency {
                    from: step_id.clone(),
                    to: dep.clone(),
                });
            }
        }
    }

    // Edges run dependency -> dependent
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    for step_id in defn.steps.keys() {
        indices.insert(step_id, graph.add_node(step_id.clone()));
    }
    for (step_id, step) in &defn.steps {
        for dep in &step.depends_on {
            graph.add_edge(indices[dep.as_str()], indices[step_id.as_str()], ());
        }
    }

    if petgraph::algo::is_cyclic_directed(&graph) {
        return Err(EngineError::CyclicDependency {
            step_id: cycle_member(&graph),
        });
    }

    // Kahn's algorithm over in-degrees
    let mut in_degree: HashMap<&str, usize> = defn
        .steps
        .iter()
        .map(|(step_id, step)| (step_id.as_str(), step.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (step_id, step) in &defn.steps {
        for dep in &step.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step_id.as_str());
        }
    }

    let mut layers = Vec::new();
    let mut remaining = defn.steps.len();
    while remaining > 0 {
        let layer: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(step_id, _)| step_id.to_string())
            .collect();

        // Cycle detection above makes this unreachable; kept so a bug
        // there cannot loop forever
        if layer.is_empty() {
            let step_id = in_degree.keys().next().map(|s| s.to_string()).unwrap_or_default();
            return Err(EngineError::CyclicDependency { step_id });
        }

        for step_id in &layer {
            in_degree.remove(step_id.as_str());
            remaining -= 1;
            if let Some(deps) = dependents.get(step_id.as_str()) {
                for dependent in deps {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                    }
                }
            }
        }

        layers.push(layer);
    }

    Ok(layers)
}

/// Pick a step that sits on a cycle, for the error message
fn cycle_member(graph: &DiGraph<String, ()>) -> String {
    for scc in petgraph::algo::tarjan_scc(graph) {
        if scc.len() > 1 {
            return graph[scc[0]].clone();
        }
        if graph.contains_edge(scc[0], scc[0]) {
            return graph[scc[0]].clone();
        }
    }
    graph
        .node_weights()
        .next()
        .cloned()
        .unwrap_or_default()
}
