//! Translator: machine-translation capability contract.

use crate::error::GatewayError;
use async_trait::async_trait;

/// Text translation between language codes.
///
/// `translate` is a no-op when `source_lang == target_lang`. Implementations
/// may take a fast path for a fixed set of common pairs, falling back to the
/// general path on failure.
#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_initialized(&self) -> bool;

    async fn initialize(&self) -> Result<(), GatewayError>;

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, GatewayError>;
}
