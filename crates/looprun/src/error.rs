use crate::broker;

/// Errors of the session layer. Calls made through a connection report
/// `looprpc::Status` instead; these cover endpoint setup and teardown.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{name}: failed to accept connection for endpoint {id}: {source}")]
    Accept {
        name: String,
        id: u32,
        #[source]
        source: broker::Error,
    },

    #[error("{name}: failed to dial endpoint {id}: {source}")]
    Dial {
        name: String,
        id: u32,
        #[source]
        source: broker::Error,
    },

    #[error("failed to release {} resource(s): {}", .0.len(), join_errors(.0))]
    Release(Vec<anyhow::Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

fn join_errors(errors: &[anyhow::Error]) -> String {
    errors
        .iter()
        .map(|e| format!("{e:#}"))
        .collect::<Vec<_>>()
        .join("; ")
}
