use std::fmt;

#[derive(Debug)]
pub enum VifitError {
    Io(std::io::Error),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Json(serde_json::Error),
    /// Checkpoint files exist but cannot be trusted. Files are left untouched.
    CorruptCheckpoint(String),
    MissingInput(String),
    OutputUnwritable(String),
    Config(String),
    /// The parallel backend failed as a whole, not a single unit.
    Dispatch(String),
    Other(String),
}

impl VifitError {
    /// Fatal errors abort the run; everything else is recovered by the orchestrator.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VifitError::Dispatch(_))
    }
}

impl fmt::Display for VifitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VifitError::Io(e) => write!(f, "IO error: {}", e),
            VifitError::Serialization(e) => write!(f, "Serialization error: {}", e),
            VifitError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            VifitError::Json(e) => write!(f, "JSON error: {}", e),
            VifitError::CorruptCheckpoint(e) => write!(f, "Corrupt checkpoint: {}", e),
            VifitError::MissingInput(e) => write!(f, "Missing input: {}", e),
            VifitError::OutputUnwritable(e) => write!(f, "Output path unwritable: {}", e),
            VifitError::Config(e) => write!(f, "Configuration error: {}", e),
            VifitError::Dispatch(e) => write!(f, "Batch dispatch error: {}", e),
            VifitError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for VifitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VifitError::Io(e) => Some(e),
            VifitError::Serialization(e) => Some(e.as_ref()),
            VifitError::Deserialization(e) => Some(e.as_ref()),
            VifitError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<bincode::error::EncodeError> for VifitError {
    fn from(err: bincode::error::EncodeError) -> Self {
        VifitError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for VifitError {
    fn from(err: bincode::error::DecodeError) -> Self {
        VifitError::Deserialization(Box::new(err))
    }
}

impl From<std::io::Error> for VifitError {
    fn from(err: std::io::Error) -> Self {
        VifitError::Io(err)
    }
}

impl From<serde_json::Error> for VifitError {
    fn from(err: serde_json::Error) -> Self {
        VifitError::Json(err)
    }
}

impl From<String> for VifitError {
    fn from(err: String) -> Self {
        VifitError::Other(err)
    }
}

impl From<&str> for VifitError {
    fn from(err: &str) -> Self {
        VifitError::Other(err.to_string())
    }
}
