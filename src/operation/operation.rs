use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use super::Phase;
use crate::connection::{Connection, ConnectionId, Position};
use crate::error::CallbackError;

/// What a lifecycle callback hands back. The value becomes the operation's
/// latest result.
pub type CallbackResult = Result<Value, CallbackError>;

type Callback = Rc<dyn Fn(&Operation, &mut Connection) -> CallbackResult>;

#[derive(Default)]
struct Results {
    by_phase: [Option<Value>; 4],
    last: Option<Phase>,
}

#[derive(Default)]
struct Inner {
    chains: RefCell<[Vec<Callback>; 4]>,
    results: RefCell<Results>,
    metadata: RefCell<HashMap<String, Value>>,
    positions: RefCell<HashMap<ConnectionId, Position>>,
    hooks: RefCell<HashSet<Uuid>>,
}

/// A deferred unit of work.
///
/// `Operation` is a cheap handle: clones share the same callbacks, metadata and
/// positions, which is what lets a callback re-register the very operation it
/// is running for. Equality is handle identity.
///
/// ```ignore
/// let op = Operation::new();
/// op.on_commit(|_, _| Ok(json!("flushed")))
///     .on_rollback(|_, _| Ok(Value::Null))
///     .set_metadata("key", "user:42");
/// connection.add_operation(&op)?;
/// ```
#[derive(Clone, Default)]
pub struct Operation {
    inner: Rc<Inner>,
}

impl Operation {
    pub fn new() -> Self {
        Operation::default()
    }

    /// Run `callback` when the owning transaction commits, or right away when
    /// registered outside any transaction.
    pub fn on_commit<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Operation, &mut Connection) -> CallbackResult + 'static,
    {
        self.register(Phase::Commit, callback)
    }

    pub fn on_rollback<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Operation, &mut Connection) -> CallbackResult + 'static,
    {
        self.register(Phase::Rollback, callback)
    }

    /// Run `callback` each time the operation is stored in a connection buffer.
    /// The position is already assigned when it runs.
    pub fn on_buffer<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Operation, &mut Connection) -> CallbackResult + 'static,
    {
        self.register(Phase::Buffer, callback)
    }

    /// Run `callback` each time the operation leaves a connection buffer,
    /// whether it was committed, rolled back or removed directly.
    pub fn on_remove<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Operation, &mut Connection) -> CallbackResult + 'static,
    {
        self.register(Phase::Remove, callback)
    }

    /// Append `callback` to the chain for `phase`.
    pub fn register<F>(&self, phase: Phase, callback: F) -> &Self
    where
        F: Fn(&Operation, &mut Connection) -> CallbackResult + 'static,
    {
        self.inner.chains.borrow_mut()[phase.slot()].push(Rc::new(callback));
        self
    }

    pub fn callback_count(&self, phase: Phase) -> usize {
        self.inner.chains.borrow()[phase.slot()].len()
    }

    pub fn commit(&self, connection: &mut Connection) -> Result<(), CallbackError> {
        self.run(Phase::Commit, connection)
    }

    pub fn rollback(&self, connection: &mut Connection) -> Result<(), CallbackError> {
        self.run(Phase::Rollback, connection)
    }

    pub fn buffer(&self, connection: &mut Connection) -> Result<(), CallbackError> {
        self.run(Phase::Buffer, connection)
    }

    pub fn remove(&self, connection: &mut Connection) -> Result<(), CallbackError> {
        self.run(Phase::Remove, connection)
    }

    /// Invoke every callback registered for `phase`, in registration order.
    ///
    /// The chain is copied before the first call, so callbacks registered while
    /// it runs only take part in later invocations. The first failing callback
    /// stops the chain.
    pub fn run(&self, phase: Phase, connection: &mut Connection) -> Result<(), CallbackError> {
        let chain: Vec<Callback> = self.inner.chains.borrow()[phase.slot()].clone();
        for callback in chain {
            let value = callback(self, &mut *connection)?;
            self.record(phase, value);
        }
        Ok(())
    }

    fn record(&self, phase: Phase, value: Value) {
        let mut results = self.inner.results.borrow_mut();
        results.by_phase[phase.slot()] = Some(value);
        results.last = Some(phase);
    }

    /// Value returned by the most recently invoked callback of any phase.
    pub fn result(&self) -> Option<Value> {
        let results = self.inner.results.borrow();
        results
            .last
            .and_then(|phase| results.by_phase[phase.slot()].clone())
    }

    /// Value returned by the most recently invoked callback of `phase`.
    pub fn result_of(&self, phase: Phase) -> Option<Value> {
        self.inner.results.borrow().by_phase[phase.slot()].clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) -> &Self {
        self.inner
            .metadata
            .borrow_mut()
            .insert(key.into(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.inner.metadata.borrow().get(key).cloned()
    }

    /// Decode a metadata entry into `T`.
    pub fn metadata_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        match self.metadata(key) {
            Some(value) => serde_json::from_value(value).map(Some),
            None => Ok(None),
        }
    }

    pub fn has_metadata(&self, key: &str) -> bool {
        self.inner.metadata.borrow().contains_key(key)
    }

    pub fn metadata_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.metadata.borrow().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Position of this operation in `connection`'s buffer, if buffered there.
    pub fn position(&self, connection: &Connection) -> Option<Position> {
        self.position_in(connection.id())
    }

    pub fn position_in(&self, connection: &ConnectionId) -> Option<Position> {
        self.inner.positions.borrow().get(connection).copied()
    }

    pub(crate) fn set_position(&self, connection: &ConnectionId, position: Position) {
        self.inner
            .positions
            .borrow_mut()
            .insert(connection.clone(), position);
    }

    /// Forget the position for `connection` if it still points at `position`.
    /// A newer registration made while the old slot was being resolved wins.
    pub(crate) fn clear_position(&self, connection: &ConnectionId, position: Position) {
        let mut positions = self.inner.positions.borrow_mut();
        if positions.get(connection) == Some(&position) {
            positions.remove(connection);
        }
    }

    /// Record that `owner` has installed its hook on this operation. Returns
    /// `false` if it already had.
    pub(crate) fn claim_hook(&self, owner: Uuid) -> bool {
        self.inner.hooks.borrow_mut().insert(owner)
    }

    pub fn ptr_eq(&self, other: &Operation) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Operation {}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chains = self.inner.chains.borrow();
        let counts: Vec<(Phase, usize)> = Phase::ALL
            .iter()
            .map(|phase| (*phase, chains[phase.slot()].len()))
            .collect();
        f.debug_struct("Operation")
            .field("positions", &self.inner.positions.borrow())
            .field("callbacks", &counts)
            .field("metadata", &self.inner.metadata.borrow())
            .field("result", &self.result())
            .finish()
    }
}
