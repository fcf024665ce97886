//! Snapshot codec: the state store plus dedup ledger as one opaque blob.
//!
//! Layout is a single format-version byte followed by the `bincode` encoding
//! of both maps. Both maps are `BTreeMap`s, so equal states produce equal bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::{ClientId, Seq};
use crate::error::SnapshotError;
use crate::ledger::DedupLedger;
use crate::store::KvStore;

pub const FORMAT_VERSION: u8 = 1;

#[derive(Serialize)]
struct ImageRef<'a> {
    store: &'a BTreeMap<String, String>,
    ledger: &'a BTreeMap<ClientId, Seq>,
}

#[derive(Deserialize)]
struct Image {
    store: BTreeMap<String, String>,
    ledger: BTreeMap<ClientId, Seq>,
}

pub fn encode(store: &KvStore, ledger: &DedupLedger) -> Result<Vec<u8>, SnapshotError> {
    let image = ImageRef {
        store: store.as_map(),
        ledger: ledger.as_map(),
    };
    let mut bytes = vec![FORMAT_VERSION];
    bincode::serialize_into(&mut bytes, &image)?;
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<(KvStore, DedupLedger), SnapshotError> {
    let (&version, body) = bytes.split_first().ok_or(SnapshotError::Empty)?;
    if version != FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let image: Image = bincode::deserialize(body)?;
    Ok((
        KvStore::from_map(image.store),
        DedupLedger::from_map(image.ledger),
    ))
}
