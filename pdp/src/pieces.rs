//! The blob-storage seam: resolving a parked piece ref to its bytes.

#[async_trait::async_trait]
pub trait PieceReader: Send + Sync + 'static {
    /// Full raw bytes of the subroot behind a `parked_piece_refs` row.
    async fn read_piece(&self, ref_id: i64) -> anyhow::Result<Vec<u8>>;
}
