use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::BackendError;
use crate::ids::RequestId;
use crate::messages::Message;
use crate::stream::ResponseStream;
use crate::tools::ToolMetadata;

/// Sampling parameters forwarded with each request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: Some(0.7),
            max_tokens: None,
        }
    }
}

/// One submission to the model backend: the full message history plus the
/// current tool list.
#[derive(Clone, Debug, Serialize)]
pub struct ModelRequest {
    pub id: RequestId,
    pub messages: Vec<Message>,
    pub streaming: bool,
    pub tools: Vec<ToolMetadata>,
    pub parameters: GenerationParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Trait implemented by each model backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Open a response stream. Returning `Ok` means the backend acknowledged
    /// the request and the stream is open.
    async fn submit(&self, request: ModelRequest) -> Result<ResponseStream, BackendError>;

    /// Out-of-band abort of an in-flight request. Unknown ids are ignored.
    async fn abort(&self, request_id: &RequestId);
}
