//! Pluggable tool-selection seam.
//!
//! The sampling/LLM subagent that narrows a client's tool list is a
//! collaborator outside the core. The core publishes this interface and a
//! pass-through default; a concrete selector can be swapped in at
//! construction.

use async_trait::async_trait;

use crate::aggregator::AggregatedItem;
use crate::error::CoreResult;

/// Narrows the tool list offered to one client.
#[async_trait]
pub trait ToolSelector: Send + Sync {
    /// Return the subset of `tools` the client should see, given its stated
    /// intent. Implementations may reorder; they must not invent entries.
    async fn select_tools_for_client(
        &self,
        client_name: &str,
        intent: Option<&str>,
        tools: Vec<AggregatedItem>,
    ) -> CoreResult<Vec<AggregatedItem>>;
}

/// Default selector: everything, unchanged.
#[derive(Debug, Default)]
pub struct PassthroughSelector;

#[async_trait]
impl ToolSelector for PassthroughSelector {
    async fn select_tools_for_client(
        &self,
        _client_name: &str,
        _intent: Option<&str>,
        tools: Vec<AggregatedItem>,
    ) -> CoreResult<Vec<AggregatedItem>> {
        Ok(tools)
    }
}
