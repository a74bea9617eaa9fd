//! Chain-fed reconcilers: once the transaction watcher confirms a
//! message, these advance the matching intent rows to their final
//! domain state.

mod delete;
mod register;
mod root_add;

pub use delete::DeleteWatcher;
pub use register::ProviderRegisterWatcher;
pub use root_add::RootAddWatcher;

use piri_db::{Db, DbResult};

use crate::eth::EthReceipt;
use crate::store;

/// Deserialize the receipt the watcher stored for a confirmed message.
pub(crate) async fn stored_receipt(db: &Db, msg_hash: &str) -> DbResult<Option<EthReceipt>> {
    let Some(wait) = store::get_message_wait(db, msg_hash).await? else {
        return Ok(None);
    };
    let Some(raw) = wait.tx_receipt else {
        return Ok(None);
    };
    let receipt = serde_json::from_slice(&raw)
        .map_err(|err| piri_db::DbError::Other(anyhow::anyhow!("corrupt stored receipt: {err}")))?;
    Ok(Some(receipt))
}
