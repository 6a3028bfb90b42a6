use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Connectivity failure from {source_id}: {reason}")]
    Connectivity { source_id: String, reason: String },

    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("Model divergence: {0}")]
    ModelDivergence(String),

    #[error("Training halted: {0}")]
    TrainingHalted(String),

    #[error("Order execution failed for {symbol}: {reason}")]
    Execution { symbol: String, reason: String },

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {amount}")]
    InvalidQuantity { amount: String },

    #[error("Invalid feature vector: {0}")]
    InvalidFeatures(String),

    #[error("Position error: {0}")]
    Position(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Transient failures that warrant another attempt; everything else is
    /// either a data problem or a state problem and retrying cannot help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::Io(_))
    }

    /// Stable label for grouping failures in counters and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connectivity { .. } => "connectivity",
            Self::DataIntegrity(_) => "data_integrity",
            Self::ModelDivergence(_) => "model_divergence",
            Self::TrainingHalted(_) => "training_halted",
            Self::Execution { .. } => "execution",
            Self::InvalidPrice(_) | Self::InvalidQuantity { .. } | Self::InvalidFeatures(_) => {
                "validation"
            }
            Self::Position(_) => "position",
            Self::Checkpoint(_) => "checkpoint",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
        }
    }

    pub fn connectivity(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connectivity {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Execution {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::connectivity("binance", "timeout").is_retryable());
        assert!(!EngineError::DataIntegrity("stale candle".to_string()).is_retryable());
        assert!(!EngineError::ModelDivergence("nan loss".to_string()).is_retryable());
        assert!(!EngineError::execution("BTC/USDT", "rejected").is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(EngineError::connectivity("kraken", "refused").kind(), "connectivity");
        assert_eq!(EngineError::InvalidPrice("non-positive".to_string()).kind(), "validation");
        assert_eq!(
            EngineError::InvalidQuantity {
                amount: "0".to_string()
            }
            .kind(),
            "validation"
        );
        assert_eq!(EngineError::DataIntegrity("stale".to_string()).kind(), "data_integrity");
    }
}
