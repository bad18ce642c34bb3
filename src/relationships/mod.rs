//! Relationship graph and async relationship proxies.

mod graph;
mod proxy;

pub(crate) use graph::Graph;
pub use proxy::{PromiseProxy, PromiseState};
