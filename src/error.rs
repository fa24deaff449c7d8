use thiserror::Error;

#[derive(Debug, Error)]
pub enum MultisplitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Structure error: {0}")]
    Structure(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Solve error: {0}")]
    Solve(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MultisplitError>;
