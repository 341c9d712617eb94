//! Error Types
//!
//! This module defines the error types used throughout the loader.
//!
//! # Overview
//!
//! The main error type [`LoaderError`] covers every recoverable failure mode:
//! - Malformed or unsupported source data (scene files, images, shaders)
//! - Precondition problems such as a size mismatch on upload
//! - GPU device failures reported by the backend
//! - Worker pool failures (a task that never delivered a result)
//!
//! Invariant violations that indicate programmer error (unloading an
//! untracked handle, a non-triangle index stream handed to the meshlet
//! builder) are not represented here; they panic.
//!
//! # Usage
//!
//! All public APIs return [`Result<T>`] which is an alias for
//! `std::result::Result<T, LoaderError>`.
//!
//! ```rust,ignore
//! use myth_loader::errors::{LoaderError, Result};
//!
//! fn load_asset() -> Result<()> {
//!     Err(LoaderError::Runtime("bad file".into()))
//! }
//! ```

use thiserror::Error;

/// The main error type for the resource loader.
#[derive(Error, Debug)]
pub enum LoaderError {
    // ========================================================================
    // Generic Runtime Errors
    // ========================================================================
    /// Recoverable data, format, or precondition problem.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The requested asset was not found.
    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    // ========================================================================
    // I/O Errors
    // ========================================================================
    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ========================================================================
    // Format & Parsing Errors
    // ========================================================================
    /// glTF parsing or loading error.
    #[error("glTF error: {0}")]
    Gltf(String),

    /// Image decoding error.
    #[error("Image decode error: {0}")]
    ImageDecode(String),

    /// The source file or container type is not supported.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// An index accessor used a component type other than u8/u16/u32.
    #[error("Unsupported index component type in {context}: {component}")]
    UnsupportedIndexType {
        /// Which mesh/primitive was being read
        context: String,
        /// The offending component type
        component: String,
    },

    /// JSON (reflection cache) error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // Shader Errors
    // ========================================================================
    /// Shader front-end or back-end failure.
    #[error("Shader compile error: {0}")]
    ShaderCompile(String),

    /// Malformed SPIR-V or an unsupported reflection construct.
    #[error("Shader reflection error: {0}")]
    Reflection(String),

    // ========================================================================
    // GPU Device Errors
    // ========================================================================
    /// The device backend rejected a call.
    #[error("Device error: {0}")]
    Device(String),

    // ========================================================================
    // Async & Threading Errors
    // ========================================================================
    /// A task was dropped before it produced a result.
    #[error("Task canceled: {0}")]
    TaskCanceled(String),

    /// A worker task panicked.
    #[error("Task join error: {0}")]
    TaskJoin(String),

    // ========================================================================
    // Platform-Specific Errors
    // ========================================================================
    /// Feature not enabled.
    #[error("Feature not enabled: {0}")]
    FeatureNotEnabled(String),
}

impl LoaderError {
    /// Shorthand for [`LoaderError::Runtime`].
    pub fn runtime(message: impl Into<String>) -> Self {
        LoaderError::Runtime(message.into())
    }
}

// ============================================================================
// Convenient conversion implementations
// ============================================================================

impl From<image::ImageError> for LoaderError {
    fn from(err: image::ImageError) -> Self {
        LoaderError::ImageDecode(err.to_string())
    }
}

#[cfg(feature = "gltf")]
impl From<gltf::Error> for LoaderError {
    fn from(err: gltf::Error) -> Self {
        LoaderError::Gltf(err.to_string())
    }
}

impl From<futures::channel::oneshot::Canceled> for LoaderError {
    fn from(err: futures::channel::oneshot::Canceled) -> Self {
        LoaderError::TaskCanceled(err.to_string())
    }
}

/// Alias for `Result<T, LoaderError>`.
pub type Result<T> = std::result::Result<T, LoaderError>;
