//! Shared plain-data types for the playground runtime.

mod types;

pub use types::{MeshHandle, Transform};
