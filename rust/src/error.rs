/// Failure modes of the presence layer. None of these are fatal; the core logs
/// them and degrades to "no live data".
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("unknown event tag `{0}`")]
    UnknownEvent(String),
    #[error("unread reconciliation failed: {0}")]
    ReconciliationFailure(String),
}
