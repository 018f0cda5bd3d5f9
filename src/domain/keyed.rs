//! Insertion-ordered map keyed by composite identifier.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Map from identifier to `T` that remembers insertion order.
///
/// Re-inserting an existing identifier replaces the value in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyed<T> {
    order: Vec<String>,
    entries: HashMap<String, T>,
}

impl<T> Default for Keyed<T> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }
}

impl<T> Keyed<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, value: T) {
        let id = id.into();
        if !self.entries.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.entries.insert(id, value);
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.entries.get_mut(id)
    }

    /// Returns the value for `id`, inserting `make()` first when absent.
    pub fn get_or_insert_with(&mut self, id: &str, make: impl FnOnce() -> T) -> &mut T {
        if !self.entries.contains_key(id) {
            self.order.push(id.to_string());
        }
        self.entries.entry(id.to_string()).or_insert_with(make)
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let removed = self.entries.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    /// Keeps only the entries for which `keep` returns true, in one pass.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &T) -> bool) {
        let entries = &mut self.entries;
        self.order.retain(|id| {
            let kept = entries.get(id).is_some_and(|value| keep(id, value));
            if !kept {
                entries.remove(id);
            }
            kept
        });
    }

    /// Moves the identifiers in `front` to the front in the order given. Unknown or repeated
    /// identifiers are skipped and everything else keeps its relative order.
    pub fn into_reordered<'a>(mut self, front: impl IntoIterator<Item = &'a str>) -> Self {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut order = Vec::with_capacity(self.order.len());
        for id in front {
            if self.entries.contains_key(id) && placed.insert(id) {
                order.push(id.to_string());
            }
        }
        order.extend(
            self.order
                .drain(..)
                .filter(|id| !placed.contains(id.as_str())),
        );
        self.order = order;
        self
    }

    pub fn contains_key(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|value| (id.as_str(), value)))
    }
}

impl<T> IntoIterator for Keyed<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(mut self) -> Self::IntoIter {
        let mut pairs = Vec::with_capacity(self.order.len());
        for id in self.order {
            if let Some(value) = self.entries.remove(&id) {
                pairs.push((id, value));
            }
        }
        pairs.into_iter()
    }
}

impl<T> FromIterator<(String, T)> for Keyed<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        let mut keyed = Self::new();
        for (id, value) in iter {
            keyed.insert(id, value);
        }
        keyed
    }
}

impl<T: Serialize> Serialize for Keyed<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (id, value) in self.iter() {
            map.serialize_entry(id, value)?;
        }
        map.end()
    }
}

struct KeyedVisitor<T>(PhantomData<T>);

impl<'de, T: Deserialize<'de>> Visitor<'de> for KeyedVisitor<T> {
    type Value = Keyed<T>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an object keyed by identifier")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut keyed = Keyed::new();
        while let Some((id, value)) = access.next_entry::<String, T>()? {
            keyed.insert(id, value);
        }
        Ok(keyed)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Keyed<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(KeyedVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_insertion_order_across_replacements() {
        let mut keyed = Keyed::new();
        keyed.insert("b", 1);
        keyed.insert("a", 2);
        keyed.insert("b", 3);

        let pairs: Vec<(&str, &i32)> = keyed.iter().collect();
        assert_eq!(pairs, [("b", &3), ("a", &2)]);
    }

    #[test]
    fn serializes_in_order() {
        let keyed: Keyed<i32> = [("z".to_string(), 1), ("a".to_string(), 2)]
            .into_iter()
            .collect();
        let text = serde_json::to_string(&keyed).expect("serialize");
        assert_eq!(text, r#"{"z":1,"a":2}"#);

        let back: Keyed<i32> = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back.keys().collect::<Vec<_>>(), ["z", "a"]);
    }

    #[test]
    fn remove_drops_order_slot() {
        let mut keyed = Keyed::new();
        keyed.insert("x", ());
        keyed.insert("y", ());
        assert!(keyed.remove("x").is_some());
        assert_eq!(keyed.keys().collect::<Vec<_>>(), ["y"]);
        assert!(keyed.remove("x").is_none());
    }

    #[test]
    fn retain_keeps_order_of_survivors() {
        let mut keyed: Keyed<i32> = (1..=5).map(|n| (n.to_string(), n)).collect();
        keyed.retain(|_, value| value % 2 == 1);
        assert_eq!(keyed.keys().collect::<Vec<_>>(), ["1", "3", "5"]);
        assert_eq!(keyed.len(), 3);
        assert!(!keyed.contains_key("2"));
    }

    #[test]
    fn reorder_puts_listed_ids_first() {
        let keyed: Keyed<i32> = ["a", "b", "c", "d"]
            .into_iter()
            .enumerate()
            .map(|(n, id)| (id.to_string(), n as i32))
            .collect();

        let reordered = keyed.into_reordered(["c", "missing", "a", "c"]);
        assert_eq!(reordered.keys().collect::<Vec<_>>(), ["c", "a", "b", "d"]);
        assert_eq!(reordered.get("c"), Some(&2));
    }
}
