//! # RVT Platform
//!
//! Threading layer for the runtime virtual texture subsystem.
//!
//! The game thread owns asset configuration; a dedicated render thread owns
//! every render resource and every call into the virtual texture allocator.
//! This crate provides that render thread and the command queue used to
//! hand work over to it.

pub mod threading;

pub use threading::{RenderCommandQueue, RenderThread, Thread, is_in_render_thread};

use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Thread spawn failed: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("Render thread is not running")]
    RenderThreadStopped,

    #[error("Render command panicked")]
    CommandPanicked,
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;
