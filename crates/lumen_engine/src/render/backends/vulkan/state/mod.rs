// Vulkan state management

pub mod frame_graph;
pub mod sync;
pub mod synchronizer;

pub use frame_graph::*;
pub use sync::*;
pub use synchronizer::*;
