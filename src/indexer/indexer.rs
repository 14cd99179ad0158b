//! Secondary index over buffered operations.
//!
//! Entries are pruned by the operations themselves: indexing an operation adds
//! a remove callback, so whatever takes it out of the connection buffer
//! (commit, rollback or a direct removal) also takes it out of the index.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use serde_json::Value;
use tracing::trace;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionId, Position};
use crate::operation::Operation;

/// One indexed slot and the keys it is registered under. `None` stands for a
/// keyless registration.
struct Entry {
    operation: Operation,
    keys: BTreeSet<Option<String>>,
}

#[derive(Default)]
struct IndexState {
    by_key: HashMap<String, BTreeMap<Position, Operation>>,
    all: BTreeMap<Position, Entry>,
}

impl IndexState {
    fn insert(&mut self, key: Option<&str>, position: Position, operation: &Operation) {
        let entry = self.all.entry(position).or_insert_with(|| Entry {
            operation: operation.clone(),
            keys: BTreeSet::new(),
        });
        if !entry.operation.ptr_eq(operation) {
            *entry = Entry {
                operation: operation.clone(),
                keys: BTreeSet::new(),
            };
        }
        entry.keys.insert(key.map(str::to_string));

        if let Some(key) = key {
            self.by_key
                .entry(key.to_string())
                .or_default()
                .insert(position, operation.clone());
        }
    }

    /// Drop one registration. The slot stays in `all` while any other key
    /// still holds it.
    fn remove(&mut self, key: Option<&str>, position: Position, operation: &Operation) {
        if let Some(key) = key {
            self.remove_keyed(key, position, operation);
        }
        let emptied = match self.all.get_mut(&position) {
            Some(entry) if entry.operation.ptr_eq(operation) => {
                entry.keys.remove(&key.map(str::to_string));
                entry.keys.is_empty()
            }
            _ => false,
        };
        if emptied {
            self.all.remove(&position);
        }
    }

    /// Drop every registration of the slot at `position`.
    fn remove_slot(&mut self, position: Position, operation: &Operation) {
        let held = self
            .all
            .get(&position)
            .map_or(false, |entry| entry.operation.ptr_eq(operation));
        if !held {
            return;
        }
        if let Some(entry) = self.all.remove(&position) {
            for key in entry.keys.iter().flatten() {
                self.remove_keyed(key, position, operation);
            }
        }
    }

    fn remove_keyed(&mut self, key: &str, position: Position, operation: &Operation) {
        if let Some(entries) = self.by_key.get_mut(key) {
            if entries
                .get(&position)
                .map_or(false, |held| held.ptr_eq(operation))
            {
                entries.remove(&position);
            }
            if entries.is_empty() {
                self.by_key.remove(key);
            }
        }
    }
}

/// Looks up buffered operations of one connection by application key.
///
/// An operation is listed under a key from the moment it is indexed until it
/// leaves the connection buffer. `Indexer` is a shared handle; clones see the
/// same entries, so a buffer callback can index its own operation.
///
/// ```ignore
/// let indexer = Indexer::new(&connection);
/// connection.start_transaction();
/// let op = connection.add_metadata("value", "v1")?;
/// indexer.index(&op, Some("users"));
/// assert_eq!(indexer.lookup_metadata("users", "value"), vec![Some(json!("v1"))]);
/// connection.rollback_transaction()?;
/// assert!(indexer.lookup("users").is_empty());
/// ```
#[derive(Clone)]
pub struct Indexer {
    connection: ConnectionId,
    hook: Uuid,
    state: Rc<RefCell<IndexState>>,
}

impl Indexer {
    pub fn new(connection: &Connection) -> Self {
        Indexer {
            connection: connection.id().clone(),
            hook: Uuid::new_v4(),
            state: Rc::new(RefCell::new(IndexState::default())),
        }
    }

    /// Identity of the connection whose buffer this index follows.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection
    }

    /// Index a buffered operation, optionally under `key`.
    ///
    /// Returns `false` without indexing when the operation is not buffered in
    /// this indexer's connection. Calling it again with another key indexes
    /// the operation under both. The first call also installs the remove hook
    /// that prunes the operation's entries; later calls reuse it.
    pub fn index(&self, operation: &Operation, key: Option<&str>) -> bool {
        let position = match operation.position_in(&self.connection) {
            Some(position) => position,
            None => return false,
        };
        self.state
            .borrow_mut()
            .insert(key, position, operation);
        trace!(
            target: "transactional::indexer",
            connection = %self.connection,
            position = %position,
            key = ?key,
            "operation indexed"
        );

        if operation.claim_hook(self.hook) {
            let state: Weak<RefCell<IndexState>> = Rc::downgrade(&self.state);
            let connection = self.connection.clone();
            operation.on_remove(move |operation, from| {
                if from.id() != &connection {
                    return Ok(Value::Null);
                }
                let state = match state.upgrade() {
                    Some(state) => state,
                    None => return Ok(Value::Null),
                };
                let position = from
                    .active_position()
                    .or_else(|| operation.position(&*from));
                if let Some(position) = position {
                    state.borrow_mut().remove_slot(position, operation);
                }
                Ok(Value::Null)
            });
        }
        true
    }

    /// Remove an operation from the index by hand. Removing an entry that is
    /// not there does nothing.
    pub fn de_index(&self, operation: &Operation, key: Option<&str>) {
        if let Some(position) = operation.position_in(&self.connection) {
            self.state
                .borrow_mut()
                .remove(key, position, operation);
        }
    }

    /// Operations indexed under `key`, in registration order.
    pub fn lookup(&self, key: &str) -> Vec<Operation> {
        self.state
            .borrow()
            .by_key
            .get(key)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Like [`lookup`](Self::lookup), with each entry keyed by its position.
    pub fn lookup_positions(&self, key: &str) -> Vec<(Position, Operation)> {
        self.state
            .borrow()
            .by_key
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(position, operation)| (*position, operation.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The `metadata_key` entry of every operation indexed under `key`.
    pub fn lookup_metadata(&self, key: &str, metadata_key: &str) -> Vec<Option<Value>> {
        self.lookup(key)
            .iter()
            .map(|operation| operation.metadata(metadata_key))
            .collect()
    }

    /// Every indexed operation regardless of key, in registration order.
    pub fn all(&self) -> Vec<Operation> {
        self.state
            .borrow()
            .all
            .values()
            .map(|entry| entry.operation.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.borrow().by_key.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn contains(&self, key: &str, operation: &Operation) -> bool {
        self.state
            .borrow()
            .by_key
            .get(key)
            .map_or(false, |entries| entries.values().any(|held| held.ptr_eq(operation)))
    }

    /// Number of distinct indexed operations.
    pub fn len(&self) -> usize {
        self.state.borrow().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().all.is_empty()
    }
}
