use async_trait::async_trait;

use crate::ids::TurnId;

#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("lookup failed: {0}")]
    Lookup(String),
}

/// Rewrites a user's input before the first request of its turn, e.g. to
/// prepend retrieved documents or remembered facts.
///
/// The rewritten text is what the model sees and what is stored in
/// context. On error the turn proceeds with the original input.
#[async_trait]
pub trait InputEnricher: Send + Sync {
    async fn enrich(&self, turn_id: TurnId, input: &str) -> Result<String, EnrichError>;
}
