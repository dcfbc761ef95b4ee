use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid key material: {0}")]
    Key(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Reed-Solomon decode failure: too many errors to correct")]
    UncorrectableFec,

    #[error("Operation {operation} not valid in state {state}")]
    SessionState {
        operation: &'static str,
        state: String,
    },

    #[error("Cipher failure: {0}")]
    Crypto(String),

    #[error("Voice codec failure: {0}")]
    Codec(String),
}

impl TunnelError {
    /// Stable numeric reason code for the control surface.
    pub fn code(&self) -> i32 {
        match self {
            TunnelError::Config(_) => 1,
            TunnelError::Key(_) => 2,
            TunnelError::Handshake(_) => 3,
            TunnelError::Frame(_) => 4,
            TunnelError::UncorrectableFec => 5,
            TunnelError::SessionState { .. } => 6,
            TunnelError::Crypto(_) => 7,
            TunnelError::Codec(_) => 8,
        }
    }

    /// Per-frame errors are absorbed by the pipeline instead of reaching the caller.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            TunnelError::Frame(_) | TunnelError::UncorrectableFec | TunnelError::Crypto(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            TunnelError::Config(String::new()),
            TunnelError::Key(String::new()),
            TunnelError::Handshake(String::new()),
            TunnelError::Frame(String::new()),
            TunnelError::UncorrectableFec,
            TunnelError::SessionState {
                operation: "start_server",
                state: "Idle".to_string(),
            },
            TunnelError::Crypto(String::new()),
            TunnelError::Codec(String::new()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_frame_local_classification() {
        assert!(TunnelError::UncorrectableFec.is_frame_local());
        assert!(TunnelError::Frame("desync".into()).is_frame_local());
        assert!(!TunnelError::Key("short".into()).is_frame_local());
    }
}
