//! Per-address activity counters.
//!
//! Each ingested transaction folds into at most two [`ActivityDelta`]s: the
//! sender's, which counts the transaction, and the recipient's, which only
//! records that the address was seen. Deltas merge monotonically, so counts
//! never go down and the seen-range only widens.
//!
//! The merge is not idempotent on its own. Stores must apply the deltas of a
//! transaction only when that transaction's row was newly inserted, in the
//! same unit of work as the insert.

use chainpulse_common::{AccountActivity, Transaction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityDelta {
    pub address: String,
    pub sent: i64,
    pub block: i64,
}

/// Deltas contributed by one transaction, ordered by address.
pub fn deltas_for(tx: &Transaction) -> Vec<ActivityDelta> {
    let mut deltas = vec![ActivityDelta {
        address: tx.from_address.clone(),
        sent: 1,
        block: tx.block_number,
    }];

    // Recipients are discovered, not counted. A self-transfer stays a single delta.
    if let Some(to) = &tx.to_address {
        if *to != tx.from_address {
            deltas.push(ActivityDelta {
                address: to.clone(),
                sent: 0,
                block: tx.block_number,
            });
        }
    }

    deltas.sort_by(|a, b| a.address.cmp(&b.address));
    deltas
}

/// Fold `delta` into the stored row (or start a new one).
pub fn merge(existing: Option<AccountActivity>, delta: &ActivityDelta) -> AccountActivity {
    match existing {
        Some(mut activity) => {
            activity.transaction_count += delta.sent.max(0);
            activity.first_seen_block = activity.first_seen_block.min(delta.block);
            activity.last_seen_block = activity.last_seen_block.max(delta.block);
            activity
        }
        None => AccountActivity {
            address: delta.address.clone(),
            transaction_count: delta.sent.max(0),
            first_seen_block: delta.block,
            last_seen_block: delta.block,
        },
    }
}
