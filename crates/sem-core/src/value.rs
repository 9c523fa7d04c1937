use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A single concrete parameter value.
///
/// Values keep their original type across a store round trip: `1` and `1.0`
/// are different values and never compare equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Str(_) => "string",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// NaN and infinities cannot be stored as JSON and are rejected up front.
    pub fn is_storable(&self) -> bool {
        match self {
            ParamValue::Float(v) => v.is_finite(),
            _ => true,
        }
    }

    /// Parse a literal the way a user would type it on a command line:
    /// `true`/`false`, integers, floats, quoted or bare strings.
    pub fn parse_literal(raw: &str) -> ParamValue {
        let s = raw.trim();
        match s {
            "true" | "True" => return ParamValue::Bool(true),
            "false" | "False" => return ParamValue::Bool(false),
            _ => {}
        }
        if let Ok(v) = s.parse::<i64>() {
            return ParamValue::Int(v);
        }
        if let Ok(v) = s.parse::<f64>() {
            if v.is_finite() {
                return ParamValue::Float(v);
            }
        }
        let unquoted = s
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .or_else(|| s.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
            .unwrap_or(s);
        ParamValue::Str(unquoted.to_string())
    }

    /// Rendering used on the target's command line.
    pub fn to_arg(&self) -> String {
        match self {
            ParamValue::Bool(v) => v.to_string(),
            ParamValue::Int(v) => v.to_string(),
            ParamValue::Float(v) => format!("{:?}", v),
            ParamValue::Str(v) => v.clone(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ParamValue::Bool(_) => 0,
            ParamValue::Int(_) => 1,
            ParamValue::Float(_) => 2,
            ParamValue::Str(_) => 3,
        }
    }
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ParamValue {}

impl PartialOrd for ParamValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParamValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ParamValue::Bool(a), ParamValue::Bool(b)) => a.cmp(b),
            (ParamValue::Int(a), ParamValue::Int(b)) => a.cmp(b),
            (ParamValue::Float(a), ParamValue::Float(b)) => a.total_cmp(b),
            (ParamValue::Str(a), ParamValue::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for ParamValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            ParamValue::Bool(v) => v.hash(state),
            ParamValue::Int(v) => v.hash(state),
            ParamValue::Float(v) => v.to_bits().hash(state),
            ParamValue::Str(v) => v.hash(state),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(v) => write!(f, "{:?}", v),
            other => f.write_str(&other.to_arg()),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_and_float_are_distinct() {
        assert_ne!(ParamValue::Int(1), ParamValue::Float(1.0));
        assert_eq!(ParamValue::Float(0.5), ParamValue::Float(0.5));
    }

    #[test]
    fn json_round_trip_preserves_types() {
        let values = vec![
            ParamValue::Bool(true),
            ParamValue::Int(3),
            ParamValue::Float(3.0),
            ParamValue::Float(1e-7),
            ParamValue::Str("3".to_string()),
        ];
        let encoded = serde_json::to_string(&values).expect("encode");
        let decoded: Vec<ParamValue> = serde_json::from_str(&encoded).expect("decode");
        for (a, b) in values.iter().zip(decoded.iter()) {
            assert_eq!(a.type_name(), b.type_name(), "type changed in {}", encoded);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn parse_literal_picks_narrowest_type() {
        assert_eq!(ParamValue::parse_literal("10"), ParamValue::Int(10));
        assert_eq!(ParamValue::parse_literal("10.0"), ParamValue::Float(10.0));
        assert_eq!(ParamValue::parse_literal("True"), ParamValue::Bool(true));
        assert_eq!(
            ParamValue::parse_literal("'wifi'"),
            ParamValue::Str("wifi".to_string())
        );
        assert_eq!(
            ParamValue::parse_literal("nan"),
            ParamValue::Str("nan".to_string())
        );
    }

    #[test]
    fn float_args_keep_a_decimal_point() {
        assert_eq!(ParamValue::Float(2.0).to_arg(), "2.0");
        assert_eq!(ParamValue::Int(2).to_arg(), "2");
    }
}
