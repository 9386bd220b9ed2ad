use std::error::Error;
use std::fmt::Display;

/// Raised when the terminal cannot be driven.
#[derive(Debug)]
pub enum GuiError {
    /// The terminal backend reported an io problem.
    Io(std::io::Error),
}

impl Display for GuiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuiError::Io(e) => write!(f, "terminal io error: {}", e),
        }
    }
}

impl Error for GuiError {}

impl From<std::io::Error> for GuiError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
