use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use crate::{
    barrier::{CompletionBarrier, Release},
    protocol::message::AgencyId,
};

/// The outcome of a successful registration, along with the number of
/// finished agencies right after it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Inserted { registered: usize },
    /// the agency was already registered, its previous connection was dropped
    Replaced { registered: usize },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("the server is shutting down")]
    ShutdownInProgress,

    #[error("agency {0} is not taking part in the draw")]
    UnknownAgency(AgencyId),
}

#[derive(Debug)]
struct Table<C> {
    connections: HashMap<AgencyId, C>,
    closed: bool,
}

/// Holds the connection of every agency that has sent its final batch,
/// and releases the completion barrier once all of them are in.
#[derive(Debug)]
pub struct Registry<C> {
    expected: usize,
    table: Mutex<Table<C>>,
    barrier: CompletionBarrier,
}

impl<C> Registry<C> {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            table: Mutex::new(Table {
                connections: HashMap::new(),
                closed: false,
            }),
            barrier: CompletionBarrier::new(),
        }
    }

    pub fn barrier(&self) -> &CompletionBarrier {
        &self.barrier
    }

    /// Whether the agency id is one of `1..=expected`
    pub fn accepts(&self, agency: AgencyId) -> bool {
        (1..=self.expected).contains(&(agency as usize))
    }

    /// Registers the connection of an agency that has finished sending bets
    ///
    /// a later registration for the same agency replaces the earlier one.
    /// fails for agencies outside `1..=expected` and once the registry has been closed,
    /// in both cases the connection is dropped without being counted.
    pub fn register(&self, agency: AgencyId, connection: C) -> Result<Registration, RegistryError> {
        if !self.accepts(agency) {
            return Err(RegistryError::UnknownAgency(agency));
        }

        // the insert and the threshold check must happen under the same lock
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.closed {
            return Err(RegistryError::ShutdownInProgress);
        }

        let replaced = table.connections.insert(agency, connection).is_some();
        let registered = table.connections.len();
        if registered >= self.expected && self.barrier.release(Release::Completed) {
            tracing::info!(registered, "every agency has finished, releasing the draw");
        }

        if replaced {
            Ok(Registration::Replaced { registered })
        } else {
            Ok(Registration::Inserted { registered })
        }
    }

    /// Hands over every registered connection, leaving the registry empty
    pub fn take_all(&self) -> HashMap<AgencyId, C> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut table.connections)
    }

    /// Refuses further registrations, drops every held connection and
    /// releases the barrier on behalf of a shutdown
    pub fn close(&self) -> usize {
        let dropped = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.closed = true;
            std::mem::take(&mut table.connections)
        };

        self.barrier.release(Release::Shutdown);
        dropped.len()
    }
}
