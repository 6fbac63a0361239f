//! # Utility Functions (`utils`)
//!
//! Archive types used to save and load optimizer state.

pub mod serialization;

pub use serialization::{
    load_optimizer, save_optimizer, InputArchive, OutputArchive, SerializationError,
};
