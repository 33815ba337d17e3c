//! The store capability set shared by every content-addressed store.

use std::collections::HashMap;

use jiff::Timestamp;

use crate::builder::bytes_to_id;
use crate::error::StoreError;
use crate::expiry::is_expired;
use crate::id::ContentId;

pub trait Store {
    /// Every identifier the store currently holds.
    fn ids(&self) -> Box<dyn Iterator<Item = &ContentId> + '_>;

    fn contains(&self, id: &ContentId) -> bool;

    /// Fetch the content for `id`.
    fn get(&mut self, id: &ContentId) -> Result<Vec<u8>, StoreError>;

    /// Store `content`, returning its identifier.
    ///
    /// When `expected` is given, it must be the identifier of `content`.
    fn put(
        &mut self,
        content: &[u8],
        expiry: Option<Timestamp>,
        expected: Option<&ContentId>,
    ) -> Result<ContentId, StoreError>;

    /// [`contains`](Store::contains) for an identifier in wire form.
    fn contains_str(&self, id: &str) -> Result<bool, StoreError> {
        let id: ContentId = id.parse()?;
        Ok(self.contains(&id))
    }

    /// [`get`](Store::get) for an identifier in wire form.
    fn get_str(&mut self, id: &str) -> Result<Vec<u8>, StoreError> {
        let id: ContentId = id.parse()?;
        self.get(&id)
    }
}

#[derive(Debug, Clone)]
struct Item {
    expiry: Option<Timestamp>,
    content: Vec<u8>,
}

/// A store that keeps content in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    items: HashMap<ContentId, Item>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn expiry(&self, id: &ContentId) -> Result<Option<Timestamp>, StoreError> {
        self.items
            .get(id)
            .map(|item| item.expiry)
            .ok_or(StoreError::NotFound)
    }

    pub fn size(&self, id: &ContentId) -> Result<u64, StoreError> {
        self.items
            .get(id)
            .map(|item| item.content.len() as u64)
            .ok_or(StoreError::NotFound)
    }
}

impl Store for MemoryStore {
    fn ids(&self) -> Box<dyn Iterator<Item = &ContentId> + '_> {
        Box::new(self.items.keys())
    }

    fn contains(&self, id: &ContentId) -> bool {
        self.items.contains_key(id)
    }

    fn get(&mut self, id: &ContentId) -> Result<Vec<u8>, StoreError> {
        let item = self.items.get(id).ok_or(StoreError::NotFound)?;
        if is_expired(item.expiry, Timestamp::now()) {
            self.items.remove(id);
            return Err(StoreError::NotFound);
        }
        Ok(item.content.clone())
    }

    fn put(
        &mut self,
        content: &[u8],
        expiry: Option<Timestamp>,
        expected: Option<&ContentId>,
    ) -> Result<ContentId, StoreError> {
        let id = bytes_to_id(content);
        if let Some(expected) = expected {
            if *expected != id {
                return Err(StoreError::Corrupted {
                    expected: expected.to_string(),
                    actual: id.to_string(),
                });
            }
        }

        self.items.insert(
            id.clone(),
            Item {
                expiry,
                content: content.to_vec(),
            },
        );
        Ok(id)
    }
}
