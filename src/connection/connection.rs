use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, trace, warn};

use super::slots::SlotTable;
use super::{ConnectionConfig, ConnectionId, ConnectionState, Position};
use crate::error::{CallbackError, CallbackFailure, Resolution, TransactionError};
use crate::operation::{CallbackResult, Operation, Phase};

/// Transaction and savepoint manager for deferred operations.
///
/// Operations registered while a transaction is open are buffered and only run
/// their commit chain once the outermost transaction commits. Rolling back any
/// level runs the rollback chain of everything registered since that level
/// was opened. Outside a transaction, registration commits immediately.
///
/// ```ignore
/// let mut connection = Connection::new();
/// connection.start_transaction();
/// connection.on_commit(|_, _| {
///     cache.invalidate("user:42");
///     Ok(Value::Null)
/// })?;
/// connection.commit_transaction()?; // runs the callback
/// ```
pub struct Connection {
    id: ConnectionId,
    operations: SlotTable<Operation>,
    savepoints: BTreeMap<usize, Position>,
    depth: usize,
    active: Option<Position>,
    detaching: Vec<Position>,
}

impl Default for Connection {
    fn default() -> Self {
        Connection::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Connection::from_config(ConnectionConfig::default())
    }

    pub fn with_id(id: impl Into<ConnectionId>) -> Self {
        Connection::from_config(ConnectionConfig::new().with_id(id))
    }

    pub fn from_config(config: ConnectionConfig) -> Self {
        Connection {
            id: config.id.unwrap_or_default(),
            operations: SlotTable::with_capacity(config.capacity),
            savepoints: BTreeMap::new(),
            depth: 0,
            active: None,
            detaching: Vec::new(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Current nesting level; 0 when no transaction is open.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Position the next buffered operation will receive.
    pub fn next_position(&self) -> Position {
        self.operations.next_position()
    }

    /// Number of buffered operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.len() == 0
    }

    /// Savepoint recorded when `depth` was opened, if it is still open.
    pub fn savepoint(&self, depth: usize) -> Option<Position> {
        self.savepoints.get(&depth).copied()
    }

    /// Buffer slot whose callbacks are running right now.
    ///
    /// Inside a commit, rollback or remove callback this is the slot being
    /// resolved, even if the callback has since re-registered the operation at
    /// a new position.
    pub fn active_position(&self) -> Option<Position> {
        self.active
    }

    /// Operation held at `position`, if that slot is still buffered.
    pub fn get(&self, position: Position) -> Option<Operation> {
        self.operations.get(position).cloned()
    }

    /// Buffered operations in registration order.
    pub fn buffered(&self) -> Vec<(Position, Operation)> {
        self.operations
            .iter()
            .map(|(position, operation)| (position, operation.clone()))
            .collect()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            id: self.id.clone(),
            depth: self.depth,
            next_position: self.operations.next_position(),
            savepoints: self.savepoints.clone(),
            buffered: self.operations.iter().map(|(position, _)| position).collect(),
        }
    }

    /// Open a transaction one level deeper. Returns the new depth.
    pub fn start_transaction(&mut self) -> usize {
        self.start_transaction_at(self.depth + 1)
    }

    /// Open a transaction at an explicit depth. Everything registered from now
    /// on belongs to that level.
    pub fn start_transaction_at(&mut self, depth: usize) -> usize {
        let savepoint = self.operations.next_position();
        self.depth = depth;
        self.savepoints.insert(depth, savepoint);
        debug!(
            target: "transactional::connection",
            connection = %self.id,
            depth,
            savepoint = %savepoint,
            "transaction started"
        );
        depth
    }

    /// Commit the innermost transaction. Buffered operations only run their
    /// commit chain when this brings the depth back to 0.
    pub fn commit_transaction(&mut self) -> Result<usize, TransactionError> {
        self.resolve(Resolution::Commit, None)
    }

    /// Commit every level above `depth`.
    pub fn commit_transaction_to(&mut self, depth: usize) -> Result<usize, TransactionError> {
        self.resolve(Resolution::Commit, Some(depth))
    }

    /// Roll back the innermost transaction, running the rollback chain of
    /// everything registered since it was opened.
    pub fn rollback_transaction(&mut self) -> Result<usize, TransactionError> {
        self.resolve(Resolution::Rollback, None)
    }

    /// Roll back every level above `depth`.
    pub fn rollback_transaction_to(&mut self, depth: usize) -> Result<usize, TransactionError> {
        self.resolve(Resolution::Rollback, Some(depth))
    }

    fn resolve(
        &mut self,
        resolution: Resolution,
        target: Option<usize>,
    ) -> Result<usize, TransactionError> {
        let old_depth = self.depth;
        let new_depth = match target {
            Some(depth) => depth,
            None => old_depth
                .checked_sub(1)
                .ok_or(TransactionError::InvalidTransaction { resolution })?,
        };
        self.depth = new_depth;

        let boundary = self.close_savepoints(old_depth, new_depth);
        debug!(
            target: "transactional::connection",
            connection = %self.id,
            from = old_depth,
            to = new_depth,
            boundary = ?boundary.map(Position::get),
            "{} transaction",
            resolution
        );

        let boundary = match boundary {
            Some(boundary) => boundary,
            None => return Ok(new_depth),
        };

        match resolution {
            Resolution::Rollback => self.sweep(resolution, boundary)?,
            Resolution::Commit if new_depth == 0 => self.sweep(resolution, boundary)?,
            Resolution::Commit => {}
        }
        Ok(new_depth)
    }

    /// Drop the savepoints of every depth in `new_depth + 1 ..= old_depth` and
    /// return the lowest position among them.
    fn close_savepoints(&mut self, old_depth: usize, new_depth: usize) -> Option<Position> {
        if new_depth >= old_depth {
            return None;
        }
        let closing: Vec<usize> = self
            .savepoints
            .range(new_depth + 1..=old_depth)
            .map(|(depth, _)| *depth)
            .collect();
        closing
            .into_iter()
            .filter_map(|depth| self.savepoints.remove(&depth))
            .min()
    }

    /// Resolve every operation buffered at or after `boundary`.
    ///
    /// Works from a snapshot taken up front: operations registered by the
    /// callbacks land past it and belong to the enclosing level. A failing
    /// operation does not stop the sweep; every snapshot entry is still
    /// resolved and removed, and the failures are reported together.
    fn sweep(&mut self, resolution: Resolution, boundary: Position) -> Result<(), TransactionError> {
        let pending: Vec<(Position, Operation)> = self
            .operations
            .iter_from(boundary)
            .map(|(position, operation)| (position, operation.clone()))
            .collect();
        debug!(
            target: "transactional::connection",
            connection = %self.id,
            boundary = %boundary,
            operations = pending.len(),
            "resolving operations ({})",
            resolution
        );

        let phase = resolution.phase();
        let mut failures = Vec::new();
        for (position, operation) in pending {
            if !self.holds(position, &operation) {
                trace!(
                    target: "transactional::connection",
                    connection = %self.id,
                    position = %position,
                    "operation left the buffer before its turn"
                );
                continue;
            }

            if let Err(error) = self.invoke(phase, &operation, position) {
                warn!(
                    target: "transactional::connection",
                    connection = %self.id,
                    position = %position,
                    error = %error,
                    "{} callback failed",
                    phase
                );
                failures.push(CallbackFailure {
                    phase,
                    position: Some(position),
                    error,
                });
            }
            if let Err(failure) = self.detach(position, &operation) {
                warn!(
                    target: "transactional::connection",
                    connection = %self.id,
                    position = %position,
                    error = %failure.error,
                    "remove callback failed"
                );
                failures.push(failure);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TransactionError::Sweep {
                resolution,
                failures,
            })
        }
    }

    fn invoke(
        &mut self,
        phase: Phase,
        operation: &Operation,
        position: Position,
    ) -> Result<(), CallbackError> {
        let previous = self.active.replace(position);
        let outcome = operation.run(phase, self);
        self.active = previous;
        outcome
    }

    /// Run the remove chain for the slot at `position`, then free the slot.
    fn detach(&mut self, position: Position, operation: &Operation) -> Result<(), CallbackFailure> {
        self.detaching.push(position);
        let outcome = self.invoke(Phase::Remove, operation, position);
        self.detaching.retain(|detaching| *detaching != position);

        if self.holds(position, operation) {
            self.operations.remove(position);
        }
        operation.clear_position(&self.id, position);
        trace!(
            target: "transactional::connection",
            connection = %self.id,
            position = %position,
            "operation removed"
        );

        outcome.map_err(|error| CallbackFailure {
            phase: Phase::Remove,
            position: Some(position),
            error,
        })
    }

    fn holds(&self, position: Position, operation: &Operation) -> bool {
        self.operations
            .get(position)
            .map_or(false, |held| held.ptr_eq(operation))
    }

    /// Register an operation.
    ///
    /// With no open transaction the commit chain runs immediately and `None` is
    /// returned. Otherwise the operation is buffered, its buffer chain runs,
    /// and its position is returned.
    pub fn add_operation(&mut self, operation: &Operation) -> Result<Option<Position>, TransactionError> {
        if self.depth == 0 {
            trace!(
                target: "transactional::connection",
                connection = %self.id,
                "no open transaction, committing immediately"
            );
            operation.commit(self).map_err(|error| CallbackFailure {
                phase: Phase::Commit,
                position: None,
                error,
            })?;
            return Ok(None);
        }

        let position = self.operations.insert(operation.clone());
        operation.set_position(&self.id, position);
        trace!(
            target: "transactional::connection",
            connection = %self.id,
            depth = self.depth,
            position = %position,
            "operation buffered"
        );

        self.invoke(Phase::Buffer, operation, position)
            .map_err(|error| CallbackFailure {
                phase: Phase::Buffer,
                position: Some(position),
                error,
            })?;
        Ok(Some(position))
    }

    pub fn has_operation(&self, operation: &Operation) -> bool {
        operation
            .position(self)
            .map_or(false, |position| self.holds(position, operation))
    }

    /// Take an operation out of the buffer without resolving it. Its remove
    /// chain still runs. Returns whether anything was removed.
    pub fn remove_operation(&mut self, operation: &Operation) -> Result<bool, TransactionError> {
        let position = match operation.position(self) {
            Some(position) => position,
            None => return Ok(false),
        };
        if !self.holds(position, operation) || self.detaching.contains(&position) {
            return Ok(false);
        }
        self.detach(position, operation)?;
        Ok(true)
    }

    /// Register a new operation with a single commit callback.
    pub fn on_commit<F>(&mut self, callback: F) -> Result<Operation, TransactionError>
    where
        F: Fn(&Operation, &mut Connection) -> CallbackResult + 'static,
    {
        let operation = Operation::new();
        operation.on_commit(callback);
        self.add_operation(&operation)?;
        Ok(operation)
    }

    /// Register a new operation with a single rollback callback.
    pub fn on_rollback<F>(&mut self, callback: F) -> Result<Operation, TransactionError>
    where
        F: Fn(&Operation, &mut Connection) -> CallbackResult + 'static,
    {
        let operation = Operation::new();
        operation.on_rollback(callback);
        self.add_operation(&operation)?;
        Ok(operation)
    }

    pub fn on_buffer<F>(&mut self, callback: F) -> Result<Operation, TransactionError>
    where
        F: Fn(&Operation, &mut Connection) -> CallbackResult + 'static,
    {
        let operation = Operation::new();
        operation.on_buffer(callback);
        self.add_operation(&operation)?;
        Ok(operation)
    }

    pub fn on_remove<F>(&mut self, callback: F) -> Result<Operation, TransactionError>
    where
        F: Fn(&Operation, &mut Connection) -> CallbackResult + 'static,
    {
        let operation = Operation::new();
        operation.on_remove(callback);
        self.add_operation(&operation)?;
        Ok(operation)
    }

    /// Register a new operation that only carries a metadata entry, for use as
    /// a transaction-scoped value.
    pub fn add_metadata(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Operation, TransactionError> {
        let operation = Operation::new();
        operation.set_metadata(key, value);
        self.add_operation(&operation)?;
        Ok(operation)
    }
}
