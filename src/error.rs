#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("Image pull failed: {0}")]
    ImagePullFailed(String),
    #[error("Container create failed: {0}")]
    CreateFailed(String),
    #[error("Container start failed: {0}")]
    StartFailed(String),
    #[error("Container stop failed: {0}")]
    StopFailed(String),
    #[error("Timed out waiting for {0}")]
    BarrierTimeout(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
