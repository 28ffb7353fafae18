use std::fmt;

#[derive(Debug)]
pub enum CubesError {
    Io(std::io::Error),
    Format(String),
    Unconnected(String),
    OracleMismatch { n: usize, expected: u64, actual: u64 },
    Other(String),
}

impl CubesError {
    /// True when the error only means "there is no cache file here".
    pub fn is_not_found(&self) -> bool {
        matches!(self, CubesError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

impl fmt::Display for CubesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CubesError::Io(e) => write!(f, "IO error: {}", e),
            CubesError::Format(e) => write!(f, "Format error: {}", e),
            CubesError::Unconnected(e) => write!(f, "Unconnected cube: {}", e),
            CubesError::OracleMismatch { n, expected, actual } => write!(
                f,
                "Result for N={} does not match the known count: expected {}, got {}",
                n, expected, actual
            ),
            CubesError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for CubesError {}

impl From<std::io::Error> for CubesError {
    fn from(err: std::io::Error) -> Self {
        CubesError::Io(err)
    }
}

impl From<String> for CubesError {
    fn from(err: String) -> Self {
        CubesError::Other(err)
    }
}

impl From<&str> for CubesError {
    fn from(err: &str) -> Self {
        CubesError::Other(err.to_string())
    }
}
