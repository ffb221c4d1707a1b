use crate::assets::ResolvedAsset;

/// Accumulates the assets resolved during one conversion call, in document
/// order. Each conversion owns its own ledger; the caller drains it once the
/// converted text comes back. Sharing an instance across conversions would
/// leak attachments between unrelated pages, so the type is deliberately
/// value-only with a consuming `drain`.
#[derive(Debug, Default)]
pub struct UploadLedger {
    assets: Vec<ResolvedAsset>,
}

impl UploadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, asset: ResolvedAsset) {
        self.assets.push(asset);
    }

    /// Consume the ledger, yielding assets in the order they were recorded.
    pub fn drain(self) -> Vec<ResolvedAsset> {
        self.assets
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}
