use std::collections::HashMap;
use tracing::debug;

use crate::db::UserStoreTx;
use crate::error::StoreError;
use crate::metrics;
use crate::models::{UserId, UserPatch};

/// Merge `patches` into existing rows in chunks of at most `chunk_size`.
///
/// Supplied fields overwrite, missing ones keep the stored value. Ids with no
/// row are skipped silently. Returns the ids that matched a row.
///
/// Patches sharing an id are folded first (later fields win), so a row is
/// written by one statement no matter where the chunk boundaries fall.
pub async fn bulk_update<T: UserStoreTx>(
    tx: &mut T,
    patches: &[UserPatch],
    chunk_size: usize,
) -> Result<Vec<UserId>, StoreError> {
    let patches = fold_by_id(patches);
    let mut matched = Vec::with_capacity(patches.len());

    for (index, chunk) in patches.chunks(chunk_size.max(1)).enumerate() {
        let ids = tx.update_chunk(chunk).await?;
        metrics::record_chunk("update");

        debug!(
            chunk = index,
            rows = chunk.len(),
            matched = ids.len(),
            "Bulk update chunk applied"
        );
        matched.extend(ids);
    }

    Ok(matched)
}

/// Merge patches with the same id, keeping first-seen order
fn fold_by_id(patches: &[UserPatch]) -> Vec<UserPatch> {
    let mut position: HashMap<UserId, usize> = HashMap::with_capacity(patches.len());
    let mut folded: Vec<UserPatch> = Vec::with_capacity(patches.len());

    for patch in patches {
        match position.get(&patch.id) {
            Some(&i) => {
                let target = &mut folded[i];
                if patch.name.is_some() {
                    target.name = patch.name.clone();
                }
                if patch.email.is_some() {
                    target.email = patch.email.clone();
                }
                if patch.age.is_some() {
                    target.age = patch.age;
                }
            }
            None => {
                position.insert(patch.id, folded.len());
                folded.push(patch.clone());
            }
        }
    }

    folded
}
