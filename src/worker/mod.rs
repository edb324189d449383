//! # Worker Components
//!
//! A worker dials the master, registers its advertised address, then serves
//! filter jobs one at a time. See [`node`].

pub mod node;

pub use node::WorkerNode;
