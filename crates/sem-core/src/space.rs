//! Parameter combinations, the Cartesian parameter space and query filters.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::FusedIterator;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Result, SemError};
use crate::value::ParamValue;
use crate::canonical_json_digest;

/// One concrete value per parameter name. Equality ignores insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterCombination(BTreeMap<String, ParamValue>);

impl ParameterCombination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) -> Option<ParamValue> {
        self.0.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deterministic identity of a (combination, repetition) pair.
    pub fn run_key(&self, repetition: u32) -> String {
        let digest = canonical_json_digest(&json!({
            "params": self,
            "repetition": repetition,
        }));
        digest[..16].to_string()
    }
}

impl fmt::Display for ParameterCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        f.write_str("}")
    }
}

impl FromIterator<(String, ParamValue)> for ParameterCombination {
    fn from_iter<T: IntoIterator<Item = (String, ParamValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The Cartesian product of per-parameter value lists.
///
/// Parameters are ordered by name; the last parameter varies fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    dims: Vec<(String, Vec<ParamValue>)>,
}

impl ParameterSpace {
    pub fn new(values: BTreeMap<String, Vec<ParamValue>>) -> Result<Self> {
        let mut dims = Vec::with_capacity(values.len());
        for (name, list) in values {
            if name.trim().is_empty() {
                return Err(SemError::validation("parameter name cannot be empty"));
            }
            if list.is_empty() {
                return Err(SemError::validation(format!(
                    "parameter '{}' has an empty value list",
                    name
                )));
            }
            for (i, v) in list.iter().enumerate() {
                if !v.is_storable() {
                    return Err(SemError::validation(format!(
                        "parameter '{}' has a non-finite value",
                        name
                    )));
                }
                if list[..i].contains(v) {
                    return Err(SemError::validation(format!(
                        "parameter '{}' lists value {} more than once",
                        name, v
                    )));
                }
            }
            dims.push((name, list));
        }
        Ok(Self { dims })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.dims.iter().map(|(n, _)| n.as_str())
    }

    pub fn values(&self, name: &str) -> Option<&[ParamValue]> {
        self.dims
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Number of combinations; an empty space has exactly one (empty) combination.
    pub fn len(&self) -> usize {
        self.dims
            .iter()
            .fold(1usize, |acc, (_, v)| acc.saturating_mul(v.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Combinations<'_> {
        Combinations {
            space: self,
            indices: vec![0; self.dims.len()],
            remaining: self.len(),
        }
    }
}

impl<'a> IntoIterator for &'a ParameterSpace {
    type Item = ParameterCombination;
    type IntoIter = Combinations<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy odometer over a [`ParameterSpace`].
#[derive(Debug, Clone)]
pub struct Combinations<'a> {
    space: &'a ParameterSpace,
    indices: Vec<usize>,
    remaining: usize,
}

impl Iterator for Combinations<'_> {
    type Item = ParameterCombination;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let current = self
            .space
            .dims
            .iter()
            .zip(self.indices.iter())
            .map(|((name, values), &i)| (name.clone(), values[i].clone()))
            .collect();
        self.remaining -= 1;
        for pos in (0..self.indices.len()).rev() {
            self.indices[pos] += 1;
            if self.indices[pos] < self.space.dims[pos].1.len() {
                break;
            }
            self.indices[pos] = 0;
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Combinations<'_> {}

impl FusedIterator for Combinations<'_> {}

/// Exact-match constraints over a partial set of parameters.
///
/// A parameter maps to the list of values it may take. Parameters not named
/// in the filter, or named with an empty list, are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamFilter(BTreeMap<String, Vec<ParamValue>>);

impl ParamFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.0.insert(name.into(), vec![value.into()]);
        self
    }

    pub fn with_any<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParamValue>,
    {
        self.0
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<ParamValue>) {
        self.0.insert(name.into(), values);
    }

    pub fn get(&self, name: &str) -> Option<&[ParamValue]> {
        self.0.get(name).map(|v| v.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<ParamValue>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| v.is_empty())
    }

    pub fn matches(&self, combination: &ParameterCombination) -> bool {
        self.0.iter().all(|(name, allowed)| {
            allowed.is_empty()
                || combination
                    .get(name)
                    .map(|v| allowed.contains(v))
                    .unwrap_or(false)
        })
    }
}

impl From<ParameterCombination> for ParamFilter {
    fn from(c: ParameterCombination) -> Self {
        Self(c.0.into_iter().map(|(k, v)| (k, vec![v])).collect())
    }
}

impl FromIterator<(String, Vec<ParamValue>)> for ParamFilter {
    fn from_iter<T: IntoIterator<Item = (String, Vec<ParamValue>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
