//! Pure DAG analysis over workflow definitions
//!
//! Stateless helpers the scheduler uses to advance a workflow: cycle
//! detection, in-degrees, start nodes, neighborhood lookups, and the
//! dependency-satisfaction check. Edges whose endpoints are not defined
//! in the node list are dropped silently, matching how templates are
//! accepted upstream.

use agentflow_common::{
    error::Result,
    types::{DagDefinition, NodeDef, NodeId, WorkflowId},
};
use agentflow_core::Store;
use petgraph::{algo::is_cyclic_directed, graph::DiGraph};
use std::collections::HashMap;

fn build_graph(dag: &DagDefinition) -> DiGraph<&str, ()> {
    let mut graph = DiGraph::new();
    let mut index = HashMap::new();

    for node in &dag.nodes {
        index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }

    for edge in &dag.edges {
        if let (Some(&from), Some(&to)) =
            (index.get(edge.from.as_str()), index.get(edge.to.as_str()))
        {
            graph.add_edge(from, to, ());
        }
    }

    graph
}

/// True iff the definition contains a cycle. Isolated nodes are acyclic.
/// O(V + E).
pub fn is_cyclic(dag: &DagDefinition) -> bool {
    is_cyclic_directed(&build_graph(dag))
}

/// Incoming-edge count per node; only edges whose `to` is a defined node
/// are counted.
pub fn in_degree(dag: &DagDefinition) -> HashMap<NodeId, usize> {
    let mut degrees: HashMap<NodeId, usize> =
        dag.nodes.iter().map(|n| (n.id.clone(), 0)).collect();
    for edge in &dag.edges {
        if let Some(degree) = degrees.get_mut(&edge.to) {
            *degree += 1;
        }
    }
    degrees
}

/// Nodes with in-degree zero, in definition order.
pub fn start_nodes(dag: &DagDefinition) -> Vec<&NodeDef> {
    let degrees = in_degree(dag);
    dag.nodes
        .iter()
        .filter(|n| degrees.get(&n.id) == Some(&0))
        .collect()
}

/// Direct successors of a node.
pub fn downstream<'a>(dag: &'a DagDefinition, node_id: &str) -> Vec<&'a str> {
    dag.edges
        .iter()
        .filter(|e| e.from == node_id)
        .map(|e| e.to.as_str())
        .collect()
}

/// Direct predecessors (dependencies) of a node.
pub fn upstream<'a>(dag: &'a DagDefinition, node_id: &str) -> Vec<&'a str> {
    dag.edges
        .iter()
        .filter(|e| e.to == node_id)
        .map(|e| e.from.as_str())
        .collect()
}

/// True iff every upstream node of `node_id` has a COMPLETED task for this
/// workflow. One count query against the store.
pub async fn dependencies_met(
    store: &dyn Store,
    workflow_id: WorkflowId,
    node_id: &str,
    dag: &DagDefinition,
) -> Result<bool> {
    let upstream: Vec<String> = upstream(dag, node_id)
        .into_iter()
        .map(str::to_string)
        .collect();
    if upstream.is_empty() {
        return Ok(true);
    }
    let completed = store.count_completed_in(workflow_id, &upstream).await?;
    Ok(completed == upstream.len() as u64)
}
