use deadpool_postgres::PoolError;
use thiserror::Error;
use tokio_postgres::error::SqlState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("postgres error while {context}: {source}")]
    Postgres {
        context: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("failed to get a connection from the pool: {0}")]
    Pool(#[from] PoolError),

    #[error("failed to build the connection pool: {0}")]
    Build(String),

    #[error("TLS setup failed: {hint}")]
    Tls {
        hint: String,
        #[source]
        source: Option<openssl::error::ErrorStack>,
    },

    /// Permanent failure injected by the in-memory test store.
    #[cfg(test)]
    #[error("rejected: {0}")]
    Rejected(String),

    /// Connectivity failure injected by the in-memory test store.
    #[cfg(test)]
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn postgres(context: impl Into<String>, source: tokio_postgres::Error) -> Self {
        Self::Postgres {
            context: context.into(),
            source,
        }
    }

    /// `true` if the connection itself is likely broken and the operation
    /// should be retried on a fresh one.
    pub fn is_temporary(&self) -> bool {
        match self {
            StoreError::Postgres { source, .. } => is_connection_error(source),
            StoreError::Pool(PoolError::Backend(source)) => is_connection_error(source),
            StoreError::Pool(PoolError::Timeout(_)) => true,
            StoreError::Pool(_) => false,
            StoreError::Build(_) | StoreError::Tls { .. } => false,
            #[cfg(test)]
            StoreError::Rejected(_) => false,
            #[cfg(test)]
            StoreError::Unavailable(_) => true,
        }
    }
}

fn is_connection_error(error: &tokio_postgres::Error) -> bool {
    error.is_closed()
        || error.code().is_some_and(|c| {
            [
                SqlState::CONNECTION_FAILURE,
                SqlState::CONNECTION_DOES_NOT_EXIST,
                SqlState::CONNECTION_EXCEPTION,
                SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION,
                SqlState::ADMIN_SHUTDOWN,
            ]
            .contains(c)
        })
        // No SQLSTATE and an I/O cause means the failure happened below the
        // protocol, e.g. the OS refused the connection.
        || (error.code().is_none()
            && std::error::Error::source(error).is_some_and(|e| e.is::<std::io::Error>()))
}
