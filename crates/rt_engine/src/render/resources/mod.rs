//! CPU-written GPU resources

pub mod constant_buffer;

pub use constant_buffer::{ConstantBuffer, SceneConstants, CONSTANT_BUFFER_ALIGNMENT};
