//! Patch-request pipeline: receive a request for a BPS patch, fetch it,
//! apply it to a base ROM, save the result and open it in an emulator.

pub mod apply;
pub mod archive;
pub mod binary_patch;
pub mod config;
pub mod error;
pub mod events;
pub mod launcher;
pub mod listener;
pub mod patch_format;
pub mod pipeline;
pub mod protocol;
pub mod source;
pub mod util;
pub mod writer;

pub use error::{PipelineError, Result};
