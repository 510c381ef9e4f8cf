use std::{fs, io::Read, path::Path};

use flate2::read::GzDecoder;
use tracing::info;

use crate::{
    crypto::Cipher,
    errors::Error,
    ports::StateStore,
    snapshot::SnapshotDocument,
    Result,
};

/// Reconstitute the snapshot document from an archive file: authenticated
/// decrypt, decompress, deserialize.
///
/// This never touches the state store; re-inserting collections is the
/// explicit, caller-driven [`apply_snapshot`] step, so a bad restore target
/// cannot silently destroy live data.
pub fn restore_archive(path: &Path, cipher: &Cipher) -> Result<SnapshotDocument> {
    let sealed = fs::read(path)
        .map_err(|e| Error::Restore(format!("read {}: {e}", path.display())))?;

    let compressed = cipher
        .open(&sealed)
        .map_err(|e| Error::Restore(format!("decrypt {}: {e}", path.display())))?;

    let mut payload = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut payload)
        .map_err(|e| Error::Restore(format!("decompress {}: {e}", path.display())))?;

    serde_json::from_slice(&payload)
        .map_err(|e| Error::Restore(format!("deserialize {}: {e}", path.display())))
}

/// Re-insert every collection of a restored snapshot into the state store.
/// Returns the number of records inserted.
pub async fn apply_snapshot(store: &dyn StateStore, doc: &SnapshotDocument) -> Result<usize> {
    let mut inserted = 0;
    for collection in &doc.collections {
        store
            .insert_many(&collection.name, &collection.records)
            .await?;
        inserted += collection.records.len();
    }

    info!(
        strategy = %doc.strategy,
        collections = doc.collections.len(),
        records = inserted,
        "snapshot applied to state store"
    );
    Ok(inserted)
}
