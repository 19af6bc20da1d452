use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("upstream not found")]
    Route,

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("wrong code: {0}")]
    Data(String),

    #[error("modifier error: {0}")]
    Modifier(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl ProxyError {
    /// Close status a failed frame leaves on the connection: protocol
    /// violations map to 1002, bad payload data to 1007, everything else
    /// keeps the normal-closure code.
    pub fn close_code(&self) -> u16 {
        match self {
            ProxyError::Protocol(_) => 1002,
            ProxyError::Data(_) => 1007,
            _ => 1000,
        }
    }
}
