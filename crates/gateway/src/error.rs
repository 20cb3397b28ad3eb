use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("serial link down: {0}")]
    LinkDown(String),
    #[error("corrupt frame: {0}")]
    FrameCorrupt(#[from] frame::FrameError),
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelationId(String),
    #[error("command {correlation_id} timed out after {attempts} attempts")]
    CommandTimeout {
        correlation_id: String,
        attempts: u32,
    },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn link_down(msg: impl ToString) -> Self {
        Self::LinkDown(msg.to_string())
    }

    pub fn broker_unavailable(msg: impl ToString) -> Self {
        Self::BrokerUnavailable(msg.to_string())
    }

    pub fn invalid_payload(msg: impl ToString) -> Self {
        Self::InvalidPayload(msg.to_string())
    }

    pub fn unknown_device(msg: impl ToString) -> Self {
        Self::UnknownDevice(msg.to_string())
    }

    pub fn config(msg: impl ToString) -> Self {
        Self::Config(msg.to_string())
    }

    /// Transient conditions that resolve on their own: the serial bridge
    /// reopens the port, the broker reconnects, the drainer retries next
    /// iteration. Everything else needs a caller decision.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::LinkDown(_)
                | GatewayError::BrokerUnavailable(_)
                | GatewayError::Store(_)
                | GatewayError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
