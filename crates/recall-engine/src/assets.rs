use async_trait::async_trait;
use tracing::warn;

use recall_core::ids::UserId;

use crate::request::AssetRef;

#[derive(Debug, thiserror::Error)]
#[error("asset fetch failed: {0}")]
pub struct AssetFetchError(pub String);

/// Loads the text content of an asset the request only referenced.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, asset: &AssetRef, user_id: &UserId) -> Result<Option<String>, AssetFetchError>;
}

/// Fetcher for deployments without an asset backend. Every referenced asset is a miss.
pub struct InlineOnlyFetcher;

#[async_trait]
impl AssetFetcher for InlineOnlyFetcher {
    async fn fetch(&self, _asset: &AssetRef, _user_id: &UserId) -> Result<Option<String>, AssetFetchError> {
        Ok(None)
    }
}

/// Asset text ready for the prompt.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedAsset {
    pub kind: String,
    pub label: String,
    pub text: String,
    /// True when the content could not be loaded and `text` is a placeholder line.
    pub placeholder: bool,
}

fn placeholder(asset: &AssetRef) -> ResolvedAsset {
    ResolvedAsset {
        kind: asset.kind.clone(),
        label: asset.label().to_string(),
        text: format!("[{} \"{}\": content unavailable]", asset.kind, asset.label()),
        placeholder: true,
    }
}

/// Resolve assets in order. Inline content is used as is; misses and fetch
/// failures degrade to a placeholder.
pub async fn resolve_assets(
    fetcher: &dyn AssetFetcher,
    assets: &[AssetRef],
    user_id: &UserId,
) -> Vec<ResolvedAsset> {
    let mut resolved = Vec::with_capacity(assets.len());
    for asset in assets {
        let text = match &asset.content {
            Some(inline) => Some(inline.clone()),
            None => match fetcher.fetch(asset, user_id).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(kind = %asset.kind, asset = asset.label(), error = %e, "asset fetch failed");
                    None
                }
            },
        };
        match text {
            Some(text) if !text.trim().is_empty() => resolved.push(ResolvedAsset {
                kind: asset.kind.clone(),
                label: asset.label().to_string(),
                text,
                placeholder: false,
            }),
            _ => resolved.push(placeholder(asset)),
        }
    }
    resolved
}
