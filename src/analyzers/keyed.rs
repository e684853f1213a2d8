//! Ordered, key-unique row storage used for every long-lived table.
//!
//! Rows carry their own key fields, so a table serializes as a plain JSON
//! array of rows and is rebuilt into a map on load.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt::Debug;

pub trait Keyed {
    type Key: Ord + Clone + Debug + Eq;

    fn key(&self) -> Self::Key;
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyedMap<T: Keyed> {
    rows: BTreeMap<T::Key, T>,
}

impl<T: Keyed> Default for KeyedMap<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<T: Keyed> KeyedMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.rows.get(key)
    }

    pub fn get_mut(&mut self, key: &T::Key) -> Option<&mut T> {
        self.rows.get_mut(key)
    }

    pub fn entry(&mut self, key: T::Key) -> Entry<'_, T::Key, T> {
        self.rows.entry(key)
    }

    /// Inserts `row` under its own key, replacing any previous row.
    pub fn upsert(&mut self, row: T) -> Option<T> {
        self.rows.insert(row.key(), row)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.rows.values()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.rows.retain(|_, row| keep(row));
    }
}

impl<T: Keyed> FromIterator<T> for KeyedMap<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().map(|row| (row.key(), row)).collect(),
        }
    }
}

impl<T: Keyed + Serialize> Serialize for KeyedMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.rows.values())
    }
}

impl<'de, T: Keyed + Deserialize<'de>> Deserialize<'de> for KeyedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rows = Vec::<T>::deserialize(deserializer)?;
        Ok(rows.into_iter().collect())
    }
}
