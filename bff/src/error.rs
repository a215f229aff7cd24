use crate::parser::ParseError;
use std::io;

/// Central error type for the BFF engine.
#[derive(Debug)]
pub enum BffError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Error during HTTP request parsing.
    Parse(ParseError),
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for BffError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BffError::Io(e) => write!(f, "I/O error: {}", e),
            BffError::Parse(e) => write!(f, "Parse error: {:?}", e),
            BffError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for BffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BffError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BffError {
    fn from(e: io::Error) -> Self {
        BffError::Io(e)
    }
}

impl From<ParseError> for BffError {
    fn from(e: ParseError) -> Self {
        BffError::Parse(e)
    }
}

pub type BffResult<T> = Result<T, BffError>;
