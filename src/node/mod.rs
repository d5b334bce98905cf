pub mod node_id;

pub use node_id::NodeId;
