/// Errors the exchange adapter can surface. Mirrors the teacher's
/// hand-written `Display` idiom rather than reaching for a derive macro.
#[derive(Debug, Clone)]
pub enum OrderError {
    RateLimited,
    MakerViolation(String),
    Rejected(String),
    Timeout,
    NetworkError(String),
    InvalidOrder(String),
}

impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderError::RateLimited => write!(f, "Rate Limited (429)"),
            OrderError::MakerViolation(s) => write!(f, "Maker Violation: {}", s),
            OrderError::Rejected(s) => write!(f, "Rejected: {}", s),
            OrderError::Timeout => write!(f, "Placement Timeout"),
            OrderError::NetworkError(s) => write!(f, "Network Error: {}", s),
            OrderError::InvalidOrder(s) => write!(f, "Invalid Order: {}", s),
        }
    }
}

impl std::error::Error for OrderError {}

/// Invalid-at-startup configuration. Fatal: the process exits rather than
/// attempting to run with a malformed grid.
#[derive(Debug, Clone)]
pub enum ConfigError {
    MissingRequired(&'static str),
    InvalidValue(String, String),
    ConflictingLimits(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingRequired(name) => write!(f, "missing required config: {}", name),
            ConfigError::InvalidValue(name, v) => write!(f, "invalid value for {}: {}", name, v),
            ConfigError::ConflictingLimits(msg) => write!(f, "conflicting configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
