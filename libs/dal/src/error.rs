use thiserror::Error;

#[derive(Debug, Error)]
pub enum DalError {
    #[error("connection pool exhausted")]
    PoolExhausted,
    #[error("query timed out")]
    QueryTimeout,
    #[error("replica unavailable")]
    ReplicaUnavailable,
    #[error("datastore error: {0}")]
    Store(String),
}

impl From<sqlx::Error> for DalError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => DalError::PoolExhausted,
            sqlx::Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                DalError::QueryTimeout
            }
            _ => DalError::Store(err.to_string()),
        }
    }
}
