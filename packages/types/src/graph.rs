use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use utoipa::ToSchema;

use crate::{ConnectionId, NodeId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Action,
    Transform,
    Condition,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub app: String,
    pub op: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
}

impl Node {
    /// The canonical identity of a node for diffing and hashing:
    /// everything that affects behavior, nothing that is cosmetic.
    pub fn canonical(&self) -> Value {
        json!({
            "type": self.kind,
            "app": self.app,
            "op": self.op,
            "params": self.params,
            "connectionId": self.connection_id,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Optional: older graphs were authored without edge ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub from: NodeId,
    pub to: NodeId,
}

impl Edge {
    /// Edge identity, falling back to the endpoint pair when no id was
    /// authored.
    pub fn key(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!("{}->{}", self.from, self.to),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default, ToSchema)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn trigger_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Trigger)
    }

    /// Structural invariants enforced on publish:
    /// unique node ids, edges reference existing nodes, exactly one
    /// trigger node, no self-loops, acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(&node.id) {
                return Err(GraphError::DuplicateNodeId(node.id.clone()));
            }
        }

        let trigger_count = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Trigger)
            .count();
        match trigger_count {
            0 => return Err(GraphError::NoTrigger),
            1 => {}
            n => return Err(GraphError::MultipleTriggers(n)),
        }

        for edge in &self.edges {
            if edge.from == edge.to {
                return Err(GraphError::SelfLoop(edge.from.clone()));
            }
            if !seen.contains(&edge.from) {
                return Err(GraphError::UnknownEdgeEndpoint(edge.from.clone()));
            }
            if !seen.contains(&edge.to) {
                return Err(GraphError::UnknownEdgeEndpoint(edge.to.clone()));
            }
        }

        // topo_order fails exactly when there is a cycle
        self.topological_order().map(|_| ())
    }

    /// Deterministic topological order: Kahn's algorithm, with ties broken
    /// by lexicographic node id so two runs of the same graph always
    /// execute in the same order.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: BTreeMap<&NodeId, usize> =
            self.nodes.iter().map(|n| (&n.id, 0)).collect();
        let mut outgoing: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();

        for edge in &self.edges {
            if let Some(deg) = in_degree.get_mut(&edge.to) {
                *deg += 1;
            }
            outgoing.entry(&edge.from).or_default().push(&edge.to);
        }

        // BTreeSet keeps the ready set sorted, which is the tie-break
        let mut ready: BTreeSet<&NodeId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(next) = ready.iter().next().cloned() {
            ready.remove(next);
            order.push(next.clone());

            if let Some(successors) = outgoing.get(next) {
                for succ in successors {
                    let deg = in_degree
                        .get_mut(succ)
                        .ok_or_else(|| GraphError::UnknownEdgeEndpoint((*succ).clone()))?;
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(succ);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(GraphError::Cycle);
        }

        Ok(order)
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum GraphError {
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(NodeId),

    #[error("edge references unknown node: {0}")]
    UnknownEdgeEndpoint(NodeId),

    #[error("edge from {0} to itself")]
    SelfLoop(NodeId),

    #[error("graph has no trigger node")]
    NoTrigger,

    #[error("graph has {0} trigger nodes, expected exactly one")]
    MultipleTriggers(usize),

    #[error("graph contains a cycle")]
    Cycle,
}
