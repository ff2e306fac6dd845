//! Helper for making any future a cancellation-aware suspension point
//! (spec.md §5: "any network call ... must be cancellation-aware: on token
//! fire they return promptly with a cancellation signal rather than
//! completing normally"). Mirrors the `tokio::select!` race against
//! `CancellationToken::cancelled()` used throughout `querymt-agent`
//! (`agent/execution/llm_retry.rs::wait_with_cancellation`).

use docent_cancel::CancelToken;
use docent_core::error::ApiError;
use std::future::Future;

#[async_trait::async_trait]
pub trait CancelAware {
    type Output;

    async fn race(self, token: &CancelToken) -> Result<Self::Output, ApiError>
    where
        Self: Sized,
        Self::Output: Send;
}

#[async_trait::async_trait]
impl<F, T> CancelAware for F
where
    F: Future<Output = T> + Send,
    T: Send,
{
    type Output = T;

    async fn race(self, token: &CancelToken) -> Result<T, ApiError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ApiError::Cancelled),
            out = self => Ok(out),
        }
    }
}
