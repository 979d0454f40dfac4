use std::fmt::Display;
use std::hash::Hash;

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("no entity with id {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Something a [`Repository`] can hold, keyed by its own identifier.
pub trait Entity: Clone + Send + Sync + 'static {
    type Id: Eq + Hash + Clone + Display + Send + Sync + 'static;

    fn id(&self) -> Self::Id;
}

/// Persistence capability offered to callers. The broker never calls it;
/// atomicity is the implementation's own concern.
pub trait Repository<E: Entity>: Send + Sync {
    /// Stores `entity`, replacing any entity with the same id.
    fn store(&self, entity: E) -> Result<E::Id, RepositoryError>;

    fn retrieve(&self, id: &E::Id) -> Result<E, RepositoryError>;
}

#[derive(Debug)]
pub struct InMemoryRepository<E: Entity> {
    items: DashMap<E::Id, E>,
}

impl<E: Entity> InMemoryRepository<E> {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
        }
    }

    pub fn remove(&self, id: &E::Id) -> Option<E> {
        self.items.remove(id).map(|(_, entity)| entity)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<E: Entity> Default for InMemoryRepository<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> Repository<E> for InMemoryRepository<E> {
    fn store(&self, entity: E) -> Result<E::Id, RepositoryError> {
        let id = entity.id();
        self.items.insert(id.clone(), entity);
        Ok(id)
    }

    fn retrieve(&self, id: &E::Id) -> Result<E, RepositoryError> {
        self.items
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }
}
