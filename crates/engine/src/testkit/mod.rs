//! Test support: an in-process loopback SIP network and an in-memory
//! scenario store. Also usable outside tests for local dry runs.

mod loopback;
mod memory_store;

pub use loopback::{LoopbackDialog, LoopbackEndpoint, LoopbackNetwork, SUPPORTED_CODECS};
pub use memory_store::MemoryScenarioStore;
