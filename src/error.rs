//! Crate-wide error type.
//!
//! Internal modules return `Result<T, EngineError>` and propagate with `?`; the binary's
//! `main` collects the top-level result as `anyhow::Result<()>`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to parse timeline input: {0}")]
    InputParseError(String),

    #[error("failed to load resource for sequence {sequence_id}: {source}")]
    ResourceLoadError {
        sequence_id: String,
        source: anyhow::Error,
    },

    #[error("shader compile failed for pass {pass_name} (vs={vertex_key}, fs={fragment_key}): {message}")]
    ShaderCompileError {
        pass_name: String,
        vertex_key: String,
        fragment_key: String,
        message: String,
    },

    #[error("expression compile failed for {sequence_id}/{plugin_id}/{uniform_name}: {message}")]
    ExpressionCompileError {
        sequence_id: String,
        plugin_id: String,
        uniform_name: String,
        message: String,
    },

    #[error("expression eval failed for {sequence_id}/{plugin_id}/{uniform_name}: {message}")]
    EvalError {
        sequence_id: String,
        plugin_id: String,
        uniform_name: String,
        message: String,
    },

    #[error("framebuffer incomplete for render target {name} ({width}x{height})")]
    FramebufferIncomplete {
        name: String,
        width: u32,
        height: u32,
    },

    #[error("encoder queue full, frame at t={timestamp_ms}ms dropped")]
    EncoderQueueFull { timestamp_ms: f64 },

    #[error("encoder fatal error: {0}")]
    EncoderFatal(String),
}
