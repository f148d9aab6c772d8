use crate::grid::GridError;
use crate::store::StoreError;

/// Stable machine-readable failure class, safe to hand to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    NoAvailability,
    Conflict,
    StoreUnavailable,
    InvalidInput,
    Forbidden,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::NoAvailability => "no_availability",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Forbidden => "forbidden",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// (entity, id)
    NotFound(&'static str, String),
    NoAvailability,
    Conflict(String),
    StoreUnavailable(String),
    InvalidInput(String),
    Forbidden(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(..) => ErrorKind::NotFound,
            EngineError::NoAvailability => ErrorKind::NoAvailability,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound(entity, id.to_string())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            EngineError::NoAvailability => write!(f, "no free space in the requested cells"),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateKey { .. } => EngineError::Conflict(e.to_string()),
            StoreError::Unavailable(_) | StoreError::Codec(_) => {
                EngineError::StoreUnavailable(e.to_string())
            }
        }
    }
}

impl From<GridError> for EngineError {
    fn from(e: GridError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}
