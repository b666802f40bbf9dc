//! Provides the in-memory containers which back a store.
//!
//! A container comes in two shapes which are selected per service:
//!
//! * An **ordered** container keeps the most recent items in insertion order. It is bounded by
//!   a fixed capacity - once full, inserting a new item evicts the oldest one. This is the
//!   shape for list-style services ("the latest posts").
//! * A **keyed** container indexes items by their id field and upserts on insert. This is the
//!   shape for lookup-style services ("the user with this name").
//!
//! Which shape is active is an explicit enum variant, so every operation states per match arm
//! what it does for each shape.
use std::collections::{HashMap, VecDeque};

use serde_json::json;

use crate::sources::{item_id, Item};

/// The default capacity of an ordered container.
pub const DEFAULT_CAPACITY: usize = 1500;

/// Holds the items of a single store.
pub enum Container {
    /// Keeps the most recent items in insertion order, bounded by a capacity.
    Ordered {
        /// The items, oldest in front, newest in the back.
        items: VecDeque<Item>,
        /// The maximal number of items to retain.
        capacity: usize,
        /// The name of the field carrying an item's identity.
        id_field: String,
    },
    /// Indexes items by their id field.
    Keyed {
        /// The items, indexed by their id.
        items: HashMap<String, Item>,
        /// The name of the field carrying an item's identity.
        id_field: String,
    },
}

impl Container {
    /// Creates an ordered container with the given capacity.
    pub fn ordered(capacity: usize, id_field: impl AsRef<str>) -> Self {
        Container::Ordered {
            items: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
            id_field: id_field.as_ref().to_owned(),
        }
    }

    /// Creates a keyed container indexing items by the given field.
    pub fn keyed(id_field: impl AsRef<str>) -> Self {
        Container::Keyed {
            items: HashMap::new(),
            id_field: id_field.as_ref().to_owned(),
        }
    }

    /// Returns the number of items currently held.
    pub fn len(&self) -> usize {
        match self {
            Container::Ordered { items, .. } => items.len(),
            Container::Keyed { items, .. } => items.len(),
        }
    }

    /// Determines if the container holds no items at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts the given item, returning **true** if the contents actually changed.
    ///
    /// For an ordered container, an item which is already present (same id, or same value if it
    /// carries no id) is skipped, and inserting into a full container evicts the oldest item -
    /// the capacity is never exceeded.
    ///
    /// For a keyed container the item replaces a previous one with the same id. An item without
    /// an id cannot be indexed and is dropped.
    pub fn insert(&mut self, item: Item) -> bool {
        match self {
            Container::Ordered {
                items,
                capacity,
                id_field,
            } => {
                let already_present = match item_id(&item, id_field) {
                    Some(id) => items
                        .iter()
                        .any(|present| item_id(present, id_field).as_deref() == Some(id.as_str())),
                    None => items.contains(&item),
                };
                if already_present {
                    return false;
                }

                items.push_back(item);
                while items.len() > *capacity {
                    let _ = items.pop_front();
                }

                true
            }
            Container::Keyed { items, id_field } => match item_id(&item, id_field) {
                Some(id) => {
                    let _ = items.insert(id, item);
                    true
                }
                None => false,
            },
        }
    }

    /// Inserts all given items and returns how many of them changed the contents.
    pub fn insert_all(&mut self, items: Vec<Item>) -> usize {
        items
            .into_iter()
            .filter(|item| self.insert(item.clone()))
            .count()
    }

    /// Returns the item with the given id if present.
    ///
    /// For a keyed container this is a plain map lookup. For an ordered container we scan,
    /// which is fine as ordered containers are small and bounded.
    pub fn get(&self, id: &str) -> Option<&Item> {
        match self {
            Container::Ordered {
                items, id_field, ..
            } => items
                .iter()
                .find(|item| item_id(item, id_field).as_deref() == Some(id)),
            Container::Keyed { items, .. } => items.get(id),
        }
    }

    /// Determines if an item with the given id is present.
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Iterates over all items.
    ///
    /// For an ordered container the items are yielded oldest first. For a keyed container the
    /// order is unspecified.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Item> + '_> {
        match self {
            Container::Ordered { items, .. } => Box::new(items.iter()),
            Container::Keyed { items, .. } => Box::new(items.values()),
        }
    }

    /// Retains only the items for which the given predicate holds.
    ///
    /// Returns the number of evicted items. This is used to apply the **cache_decay** of a
    /// strategy.
    pub fn retain(&mut self, predicate: impl Fn(&Item) -> bool) -> usize {
        let before = self.len();
        match self {
            Container::Ordered { items, .. } => items.retain(|item| predicate(item)),
            Container::Keyed { items, .. } => items.retain(|_, item| predicate(item)),
        }

        before - self.len()
    }

    /// Renders the contents into a JSON snapshot.
    pub fn to_snapshot(&self) -> serde_json::Value {
        let items: Vec<&Item> = self.iter().collect();
        json!(items)
    }

    /// Re-inserts the items of a previously taken snapshot, returning how many were restored.
    pub fn load_snapshot(&mut self, snapshot: &serde_json::Value) -> usize {
        match snapshot.as_array() {
            Some(items) => self.insert_all(items.clone()),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::container::Container;
    use serde_json::json;

    #[test]
    fn ordered_containers_evict_the_oldest_item_when_full() {
        let mut container = Container::ordered(3, "id");

        for index in 1..=4 {
            assert_eq!(container.insert(json!({ "id": index.to_string() })), true);
        }

        // The capacity is never exceeded and the oldest item is gone...
        assert_eq!(container.len(), 3);
        assert_eq!(container.contains("1"), false);
        assert_eq!(container.contains("2"), true);
        assert_eq!(container.contains("4"), true);
    }

    #[test]
    fn ordered_containers_skip_duplicates() {
        let mut container = Container::ordered(10, "id");

        assert_eq!(container.insert(json!({ "id": "a", "title": "first" })), true);
        assert_eq!(container.insert(json!({ "id": "a", "title": "again" })), false);
        assert_eq!(container.len(), 1);

        // Items without an id are deduplicated by value...
        assert_eq!(container.insert(json!({ "title": "anonymous" })), true);
        assert_eq!(container.insert(json!({ "title": "anonymous" })), false);
        assert_eq!(container.len(), 2);
    }

    #[test]
    fn numeric_ids_index_like_string_ids() {
        let mut container = Container::keyed("id");

        assert_eq!(container.insert(json!({ "id": 1, "title": "numbered" })), true);
        assert_eq!(container.get("1").unwrap()["title"].as_str().unwrap(), "numbered");

        let mut container = Container::ordered(10, "id");
        assert_eq!(container.insert(json!({ "id": 7 })), true);
        assert_eq!(container.insert(json!({ "id": 7 })), false);
        assert_eq!(container.contains("7"), true);
    }

    #[test]
    fn keyed_containers_upsert_by_id() {
        let mut container = Container::keyed("id");

        assert_eq!(container.insert(json!({ "id": "a", "value": 1 })), true);
        assert_eq!(container.insert(json!({ "id": "a", "value": 2 })), true);
        assert_eq!(container.len(), 1);
        assert_eq!(container.get("a").unwrap()["value"].as_i64().unwrap(), 2);

        // An item without an id cannot be indexed...
        assert_eq!(container.insert(json!({ "value": 3 })), false);
        assert_eq!(container.len(), 1);
    }

    #[test]
    fn retain_reports_the_number_of_evicted_items() {
        let mut container = Container::ordered(10, "id");
        let _ = container.insert_all(vec![
            json!({ "id": "a", "updated": 50.0 }),
            json!({ "id": "b", "updated": 150.0 }),
            json!({ "id": "c", "updated": 250.0 }),
        ]);

        let evicted = container.retain(|item| item["updated"].as_f64().unwrap_or(0.0) > 100.0);
        assert_eq!(evicted, 1);
        assert_eq!(container.len(), 2);
        assert_eq!(container.contains("a"), false);
    }

    #[test]
    fn snapshots_restore_the_contents() {
        let mut container = Container::ordered(10, "id");
        let _ = container.insert_all(vec![
            json!({ "id": "a" }),
            json!({ "id": "b" }),
        ]);

        let snapshot = container.to_snapshot();

        let mut restored = Container::ordered(10, "id");
        assert_eq!(restored.load_snapshot(&snapshot), 2);
        assert_eq!(restored.contains("a"), true);
        assert_eq!(restored.contains("b"), true);

        // A malformed snapshot restores nothing instead of failing...
        let mut empty = Container::ordered(10, "id");
        assert_eq!(empty.load_snapshot(&serde_json::json!({ "not": "an array" })), 0);
    }
}
