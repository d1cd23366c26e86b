use tonic::Status;

/// The error taxonomy from the design doc. Internal code returns
/// `anyhow::Result` almost everywhere; this is the single conversion
/// point at the RPC boundary, so nothing downstream re-wraps a status
/// code it doesn't own.
#[derive(thiserror::Error, Debug)]
pub enum NixCsiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),

    #[error("{0} not implemented")]
    Unimplemented(&'static str),
}

impl NixCsiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}

impl From<NixCsiError> for Status {
    fn from(err: NixCsiError) -> Self {
        match err {
            NixCsiError::BadRequest(msg) => {
                tracing::warn!(error = %msg, "rejecting request");
                Status::invalid_argument(msg)
            }
            NixCsiError::Internal(err) => {
                tracing::error!(error = ?err, "internal failure");
                Status::internal(err.to_string())
            }
            NixCsiError::Unimplemented(rpc) => Status::unimplemented(format!("{rpc} not implemented")),
        }
    }
}

pub type NixCsiResult<T> = Result<T, NixCsiError>;
