//! Timeout-bounded reachability counting over a tree overlay.
//!
//! A root spreads a rumor down the tree, every reached node acknowledges back
//! toward the root, and the root reports how many nodes confirmed within a
//! window that only closes after a full timeout period of silence.
pub mod cli;
pub mod error;
pub mod node;
pub mod protocol;
pub mod settings;
pub mod simulation;
pub mod tree;
