//! Error types shared across the playout core

/// Errors surfaced by playout engine operations.
///
/// Precondition failures leave the engine state untouched; the control server
/// forwards the display message to the operator as an `error` event.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("no {0} surface attached")]
    NotAttached(&'static str),

    #[error("no template loaded on preview")]
    PreviewNotReady,

    #[error("take requires a loaded preview and both surfaces attached")]
    TakeNotReady,

    #[error("surface rejected {op}: {source}")]
    Surface {
        op: &'static str,
        #[source]
        source: SurfaceError,
    },
}

impl EngineError {
    pub(crate) fn surface(op: &'static str, source: SurfaceError) -> Self {
        Self::Surface { op, source }
    }
}

/// Errors reported by a rendering surface binding.
#[derive(thiserror::Error, Debug)]
pub enum SurfaceError {
    #[error("renderer is gone: {0}")]
    RendererGone(String),

    #[error("document load failed: {0}")]
    LoadFailed(String),

    #[error("template hook {0} rejected: {1}")]
    HookRejected(&'static str, String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_operator_readable() {
        assert_eq!(
            EngineError::NotAttached("preview").to_string(),
            "no preview surface attached"
        );
        assert!(EngineError::PreviewNotReady
            .to_string()
            .contains("no template loaded"));
    }

    #[test]
    fn surface_error_keeps_source() {
        let err = EngineError::surface(
            "play",
            SurfaceError::HookRejected("play", "script threw".into()),
        );
        assert!(err.to_string().contains("play"));
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("script threw"));
    }
}
