//! The table of operations in progress on one connection.
//!
//! All the interesting concurrency guarantees of the connection lifecycle come down to one rule:
//! admission, the start of a disconnect, and every sweep serialize through the single mutex in
//! [`PendingOperationTable`].  Once [`PendingOperationTable::begin_disconnect`] has returned, no
//! insert can land, so a subsequent drain sees every record that will ever be in the table.
//!
//! The other rule is that whoever removes a record is the one (and only one) entitled to resolve
//! its promise.  A worker delivering a result and a sweep cancelling the operation both go
//! through removal, so exactly one of them gets the record and the other finds nothing.
use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::Mutex;

use crate::operation::Operation;
use crate::promise::PromiseResolver;
use crate::types::{MessageId, OperationResult, SearchItem};
use crate::{DirError, Result};

/// One in-flight operation: the operation itself, and the write side of its promise (which also
/// owns the streaming channel for searches).
pub(crate) struct PendingRecord {
    operation: Arc<Operation>,
    resolver: PromiseResolver,
}

impl PendingRecord {
    pub(crate) fn new(operation: Arc<Operation>, resolver: PromiseResolver) -> Self {
        Self { operation, resolver }
    }

    pub(crate) fn operation(&self) -> &Arc<Operation> {
        &self.operation
    }

    pub(crate) fn message_id(&self) -> MessageId {
        self.operation.message_id()
    }

    pub(crate) fn resolve(&self, outcome: Result<OperationResult>) -> bool {
        self.resolver.resolve(outcome)
    }

    pub(crate) fn push(&self, item: SearchItem) -> bool {
        self.resolver.push(item)
    }
}

struct TableState {
    disconnect_requested: bool,
    records: HashMap<MessageId, Arc<PendingRecord>>,
}

pub(crate) struct PendingOperationTable {
    max_operations: Option<usize>,
    state: Mutex<TableState>,
}

impl PendingOperationTable {
    pub(crate) fn new(max_operations: Option<usize>) -> Self {
        Self {
            max_operations,
            state: Mutex::new(TableState {
                disconnect_requested: false,
                records: HashMap::new(),
            }),
        }
    }

    /// Admit a record into the table.
    ///
    /// Fails without modifying the table if a disconnect has begun, if the table is full, or if
    /// an operation with the same message ID is already present.
    pub(crate) fn insert(&self, record: Arc<PendingRecord>) -> Result<()> {
        let mut state = self.state.lock();

        if state.disconnect_requested {
            return Err(DirError::DisconnectInProgress);
        }

        if let Some(limit) = self.max_operations {
            if state.records.len() >= limit {
                return Err(DirError::AdminLimitExceeded { limit });
            }
        }

        let message_id = record.message_id();
        if state.records.contains_key(&message_id) {
            return Err(DirError::DuplicateOperationId { message_id });
        }

        state.records.insert(message_id, record);
        Ok(())
    }

    pub(crate) fn remove(&self, message_id: MessageId) -> Option<Arc<PendingRecord>> {
        self.state.lock().records.remove(&message_id)
    }

    pub(crate) fn get(&self, message_id: MessageId) -> Option<Arc<PendingRecord>> {
        self.state.lock().records.get(&message_id).cloned()
    }

    /// Stop admitting new records.
    ///
    /// Returns `true` only for the first caller; everyone after that gets `false` and should
    /// treat the disconnect as already handled.
    pub(crate) fn begin_disconnect(&self) -> bool {
        let mut state = self.state.lock();
        if state.disconnect_requested {
            false
        } else {
            state.disconnect_requested = true;
            true
        }
    }

    /// Empty the table, returning every record that was in it, ordered by message ID.
    pub(crate) fn drain_all(&self) -> Vec<Arc<PendingRecord>> {
        let mut state = self.state.lock();
        state
            .records
            .drain()
            .map(|(_, record)| record)
            .sorted_by_key(|record| record.message_id())
            .collect()
    }

    /// Like [`Self::drain_all`], but the record for `keep` (if there is one) stays in the table
    /// the whole time and is never returned.
    pub(crate) fn drain_all_except(&self, keep: MessageId) -> Vec<Arc<PendingRecord>> {
        let mut state = self.state.lock();
        let kept = state.records.remove(&keep);
        let drained = state
            .records
            .drain()
            .map(|(_, record)| record)
            .sorted_by_key(|record| record.message_id())
            .collect();

        if let Some(kept) = kept {
            state.records.insert(keep, kept);
        }
        drained
    }

    pub(crate) fn operations(&self) -> Vec<Arc<Operation>> {
        self.state
            .lock()
            .records
            .values()
            .map(|record| record.operation().clone())
            .sorted_by_key(|operation| operation.message_id())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }
}
