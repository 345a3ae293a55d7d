use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogicError {
    #[error("IO error ({context}): {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Not connected to the Logic application")]
    NotConnected,
    #[error("A command is still awaiting its response")]
    Busy,
    #[error("Command rejected by device: {0}")]
    Rejected(String),
    #[error("Invalid device entry: {0}")]
    InvalidDevice(String),
    #[error("Invalid sample rate entry: {0}")]
    InvalidSampleRate(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<std::io::Error> for LogicError {
    fn from(source: std::io::Error) -> Self {
        LogicError::Io {
            source,
            context: "unspecified".to_string(),
        }
    }
}
