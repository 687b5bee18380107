//! Local inference servers and the resources they consume.

pub mod broker;
pub mod pool;
pub mod vllm;
