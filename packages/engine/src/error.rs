use flowline_types::{GraphError, NodeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("graph: {0}")]
    Graph(#[from] GraphError),

    #[error("node {node_id} references missing output: {reference}")]
    MissingReference { node_id: NodeId, reference: String },

    #[error("replay start node {0} is not in the graph")]
    UnknownStartNode(NodeId),

    #[error("credential resolution failed for node {node_id}: {message}")]
    Credentials { node_id: NodeId, message: String },

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}
