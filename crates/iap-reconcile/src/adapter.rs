use iap_schemas::{AssetId, ProductId, TransactionId};

/// Outbound requests to the commerce provider.
///
/// Every call is fire-and-forget: outcomes come back later through the
/// provider callbacks the engine ingests. Implementations must be cheap and
/// must not call back into the engine synchronously.
pub trait StoreAdapter: Send + Sync {
    /// Stable adapter identifier, used in logs.
    fn name(&self) -> &'static str;

    fn request_purchase(&self, product_id: &ProductId);

    fn request_restore_all(&self);

    fn request_downloads_start(&self, asset_ids: &[AssetId]);

    /// Tell the provider the transaction is fully processed and may leave
    /// its queue.
    fn acknowledge_transaction(&self, transaction_id: &TransactionId);
}
