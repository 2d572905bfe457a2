//! Test dimensions and their cartesian product.
//!
//! Combinations are enumerated lexicographically: the first-declared
//! dimension varies slowest, the last one fastest.

use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::config::BenchConfig;

/// Name of the dimension generated from `test.test_repeats`.
pub const REPEAT_DIMENSION: &str = "repeat_id";

/// A single dimension value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimensionValue {
    Int(i64),
    Text(String),
}

impl DimensionValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DimensionValue::Int(v) => u64::try_from(*v).ok(),
            DimensionValue::Text(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for DimensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionValue::Int(v) => write!(f, "{}", v),
            DimensionValue::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dimension {
    pub name: String,
    pub values: Vec<DimensionValue>,
}

/// Ordered set of dimensions describing the whole sweep.
#[derive(Debug, Clone, Default)]
pub struct DimensionSet {
    dimensions: Vec<Dimension>,
}

impl DimensionSet {
    pub fn new(dimensions: Vec<Dimension>) -> Self {
        Self { dimensions }
    }

    /// Declared dimensions, plus `repeat_id` last when `test_repeats` is set.
    pub fn from_config(config: &BenchConfig) -> Self {
        let mut dimensions: Vec<Dimension> = config
            .dimensions
            .iter()
            .map(|d| Dimension {
                name: d.name.clone(),
                values: d.values.clone(),
            })
            .collect();
        if let Some(repeats) = config.test.test_repeats {
            dimensions.push(Dimension {
                name: REPEAT_DIMENSION.to_string(),
                values: (0..i64::from(repeats)).map(DimensionValue::Int).collect(),
            });
        }
        Self { dimensions }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.dimensions.iter().map(|d| d.name.as_str())
    }

    /// Number of combinations. An empty value list empties the product;
    /// no dimensions at all yields one empty combination.
    pub fn len(&self) -> usize {
        self.dimensions.iter().map(|d| d.values.len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Combinations<'_> {
        Combinations {
            set: self,
            cursor: vec![0; self.dimensions.len()],
            index: 0,
            done: self.is_empty(),
        }
    }
}

/// Odometer over the value indices of a [`DimensionSet`].
pub struct Combinations<'a> {
    set: &'a DimensionSet,
    cursor: Vec<usize>,
    index: usize,
    done: bool,
}

impl Iterator for Combinations<'_> {
    type Item = Combination;

    fn next(&mut self) -> Option<Combination> {
        if self.done {
            return None;
        }
        let values = self
            .set
            .dimensions
            .iter()
            .zip(&self.cursor)
            .map(|(dim, &i)| (dim.name.clone(), dim.values[i].clone()))
            .collect();
        let combination = Combination {
            index: self.index,
            values,
        };
        self.index += 1;

        // Advance from the last dimension; carry leftwards.
        self.done = true;
        for (pos, dim) in self.set.dimensions.iter().enumerate().rev() {
            self.cursor[pos] += 1;
            if self.cursor[pos] < dim.values.len() {
                self.done = false;
                break;
            }
            self.cursor[pos] = 0;
        }

        Some(combination)
    }
}

/// One point of the sweep. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Combination {
    /// Position in enumeration order, starting at 0.
    pub index: usize,
    values: Vec<(String, DimensionValue)>,
}

impl Combination {
    pub fn new(index: usize, values: Vec<(String, DimensionValue)>) -> Self {
        Self { index, values }
    }

    pub fn get(&self, name: &str) -> Option<&DimensionValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(DimensionValue::as_u64)
    }

    pub fn values(&self) -> &[(String, DimensionValue)] {
        &self.values
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}={}", name, value)?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for Combination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(name: &str, vals: &[i64]) -> Dimension {
        Dimension {
            name: name.to_string(),
            values: vals.iter().copied().map(DimensionValue::Int).collect(),
        }
    }

    #[test]
    fn test_first_dimension_varies_slowest() {
        let set = DimensionSet::new(vec![ints("threads", &[1, 2]), ints("hosts", &[10, 20, 30])]);
        let seen: Vec<String> = set.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            seen,
            vec![
                "threads=1 hosts=10",
                "threads=1 hosts=20",
                "threads=1 hosts=30",
                "threads=2 hosts=10",
                "threads=2 hosts=20",
                "threads=2 hosts=30",
            ]
        );
        assert_eq!(set.len(), 6);
    }

    #[test]
    fn test_indices_are_sequential() {
        let set = DimensionSet::new(vec![ints("a", &[1, 2]), ints("b", &[1, 2])]);
        let indices: Vec<usize> = set.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_empty_value_list_yields_nothing() {
        let set = DimensionSet::new(vec![ints("a", &[1, 2]), ints("b", &[])]);
        assert!(set.is_empty());
        assert_eq!(set.iter().count(), 0);
    }

    #[test]
    fn test_no_dimensions_yields_single_run() {
        let set = DimensionSet::default();
        let all: Vec<Combination> = set.iter().collect();
        assert_eq!(all.len(), 1);
        assert!(all[0].values().is_empty());
    }

    #[test]
    fn test_repeats_appended_last() {
        let mut config = BenchConfig::default();
        config.dimensions.push(crate::config::DimensionConfig {
            name: "threads".into(),
            values: vec![DimensionValue::Int(1), DimensionValue::Int(2)],
        });
        config.test.test_repeats = Some(2);
        let set = DimensionSet::from_config(&config);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["threads", "repeat_id"]);
        let first_two: Vec<Option<u64>> =
            set.iter().take(2).map(|c| c.get_u64(REPEAT_DIMENSION)).collect();
        assert_eq!(first_two, vec![Some(0), Some(1)]);
    }

    #[test]
    fn test_value_accessors() {
        let c = Combination::new(
            0,
            vec![
                ("threads".into(), DimensionValue::Int(4)),
                ("mode".into(), DimensionValue::Text("Latency".into())),
                ("delay".into(), DimensionValue::Int(-1)),
            ],
        );
        assert_eq!(c.get_u64("threads"), Some(4));
        assert_eq!(c.get_u64("mode"), None);
        assert_eq!(c.get_u64("delay"), None);
        assert_eq!(c.get("missing"), None);
    }

    #[test]
    fn test_serializes_as_flat_map() {
        let c = Combination::new(
            3,
            vec![
                ("threads".into(), DimensionValue::Int(4)),
                ("mode".into(), DimensionValue::Text("Latency".into())),
            ],
        );
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json, serde_json::json!({"threads": 4, "mode": "Latency"}));
    }
}
