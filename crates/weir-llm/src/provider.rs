use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use weir_types::Result;

use crate::{ChatDelta, ChatRequest, ChatResponse};

/// Boxed stream of completion deltas.
pub type DeltaStream<'a> = Pin<Box<dyn Stream<Item = Result<ChatDelta>> + Send + 'a>>;

/// A chat-completion provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Run a request to completion and return the full response.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Stream a request as a sequence of deltas.
    fn stream(&self, request: &ChatRequest) -> DeltaStream<'_>;

    fn supports_streaming(&self) -> bool {
        true
    }
}

/// Object-safe wrapper around a provider adapter.
pub struct DynProvider(Box<dyn ProviderAdapter>);

impl DynProvider {
    pub fn new(adapter: impl ProviderAdapter + 'static) -> Self {
        Self(Box::new(adapter))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.0.complete(request).await
    }

    pub fn stream(&self, request: &ChatRequest) -> DeltaStream<'_> {
        self.0.stream(request)
    }

    pub fn supports_streaming(&self) -> bool {
        self.0.supports_streaming()
    }
}
