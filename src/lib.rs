pub mod common;
pub mod filter;
pub mod master;
pub mod submitter;
pub mod worker;

pub use common::messages::{ImagePacket, MessageKind, NetworkMessage};
pub use master::Dispatcher;
pub use submitter::Submitter;
pub use worker::WorkerNode;
