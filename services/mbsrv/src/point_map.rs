//! Point map: logical point names to register ranges
//!
//! Built once from configuration and immutable afterwards. Also owns the
//! conversions between typed point values and raw 16-bit words.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{MemoryConfig, PointConfig};
use crate::error::{ConfigError, PointError};
use crate::store::Table;

/// Point data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "boolean")]
    Bool,
    #[serde(alias = "uint16")]
    U16,
    #[serde(alias = "int16")]
    I16,
    #[serde(alias = "uint32")]
    U32,
    #[serde(alias = "int32")]
    I32,
    #[serde(alias = "float32", alias = "float")]
    F32,
}

impl DataType {
    /// Number of table units (bits or registers) one element occupies
    #[inline]
    pub fn width(self) -> usize {
        match self {
            DataType::Bool | DataType::U16 | DataType::I16 => 1,
            DataType::U32 | DataType::I32 | DataType::F32 => 2,
        }
    }

    /// Whether this type may live in the given table
    #[inline]
    pub fn fits(self, table: Table) -> bool {
        (self == DataType::Bool) == table.is_bit()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::U16 => "u16",
            DataType::I16 => "i16",
            DataType::U32 => "u32",
            DataType::I32 => "i32",
            DataType::F32 => "f32",
        }
    }

    /// Encode one scalar into `width()` words (32-bit types: high word first)
    fn encode_scalar(self, name: &str, value: &PointValue) -> Result<Vec<u16>, PointError> {
        let mismatch = |reason: String| PointError::TypeMismatch {
            name: name.to_string(),
            reason,
        };
        let out_of_range = |v: &dyn fmt::Display| PointError::OutOfRange {
            name: name.to_string(),
            reason: format!("{} does not fit {}", v, self.as_str()),
        };

        match (self, value) {
            (DataType::Bool, PointValue::Bool(b)) => Ok(vec![u16::from(*b)]),
            (DataType::Bool, PointValue::Int(i)) if *i == 0 || *i == 1 => Ok(vec![*i as u16]),
            (DataType::U16, PointValue::Int(i)) => u16::try_from(*i)
                .map(|v| vec![v])
                .map_err(|_| out_of_range(i)),
            (DataType::I16, PointValue::Int(i)) => i16::try_from(*i)
                .map(|v| vec![v as u16])
                .map_err(|_| out_of_range(i)),
            (DataType::U32, PointValue::Int(i)) => u32::try_from(*i)
                .map(split_u32)
                .map_err(|_| out_of_range(i)),
            (DataType::I32, PointValue::Int(i)) => i32::try_from(*i)
                .map(|v| split_u32(v as u32))
                .map_err(|_| out_of_range(i)),
            (DataType::F32, PointValue::Int(i)) => Ok(split_u32((*i as f32).to_bits())),
            (DataType::F32, PointValue::Float(f)) => {
                if f.is_finite() && f.abs() > f64::from(f32::MAX) {
                    return Err(out_of_range(f));
                }
                Ok(split_u32((*f as f32).to_bits()))
            },
            (_, PointValue::Array(_)) => Err(mismatch("nested arrays are not supported".into())),
            (dt, other) => Err(mismatch(format!(
                "expected {}, got {}",
                dt.as_str(),
                other.kind()
            ))),
        }
    }

    /// Decode one element from exactly `width()` words
    fn decode_scalar(self, words: &[u16]) -> PointValue {
        match self {
            DataType::Bool => PointValue::Bool(words[0] != 0),
            DataType::U16 => PointValue::Int(i64::from(words[0])),
            DataType::I16 => PointValue::Int(i64::from(words[0] as i16)),
            DataType::U32 => PointValue::Int(i64::from(join_u32(words))),
            DataType::I32 => PointValue::Int(i64::from(join_u32(words) as i32)),
            DataType::F32 => PointValue::Float(f64::from(f32::from_bits(join_u32(words)))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[inline]
fn split_u32(v: u32) -> Vec<u16> {
    vec![(v >> 16) as u16, (v & 0xFFFF) as u16]
}

#[inline]
fn join_u32(words: &[u16]) -> u32 {
    (u32::from(words[0]) << 16) | u32::from(words[1])
}

/// Typed value of a point, as exchanged with the HTTP layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Array(Vec<PointValue>),
}

impl PointValue {
    fn kind(&self) -> &'static str {
        match self {
            PointValue::Bool(_) => "bool",
            PointValue::Int(_) => "integer",
            PointValue::Float(_) => "float",
            PointValue::Array(_) => "array",
        }
    }
}

/// A resolved point definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDef {
    pub name: String,
    pub table: Table,
    pub start_address: u16,
    pub length: u16,
    pub data_type: DataType,
}

impl PointDef {
    /// Number of table units covered: `length × width`
    #[inline]
    pub fn span(&self) -> usize {
        usize::from(self.length) * self.data_type.width()
    }

    /// Exclusive end address
    #[inline]
    pub fn end(&self) -> usize {
        usize::from(self.start_address) + self.span()
    }

    /// Convert a typed value into raw words covering the full span
    pub fn encode(&self, value: &PointValue) -> Result<Vec<u16>, PointError> {
        match value {
            PointValue::Array(items) if self.length > 1 => {
                if items.len() != usize::from(self.length) {
                    return Err(PointError::TypeMismatch {
                        name: self.name.clone(),
                        reason: format!(
                            "expected {} elements, got {}",
                            self.length,
                            items.len()
                        ),
                    });
                }
                let mut words = Vec::with_capacity(self.span());
                for item in items {
                    words.extend(self.data_type.encode_scalar(&self.name, item)?);
                }
                Ok(words)
            },
            PointValue::Array(_) => Err(PointError::TypeMismatch {
                name: self.name.clone(),
                reason: "scalar point does not accept an array".to_string(),
            }),
            scalar if self.length == 1 => self.data_type.encode_scalar(&self.name, scalar),
            _ => Err(PointError::TypeMismatch {
                name: self.name.clone(),
                reason: format!("array point expects {} elements", self.length),
            }),
        }
    }

    /// Convert raw words (exactly `span()` of them) into a typed value
    pub fn decode(&self, words: &[u16]) -> PointValue {
        let width = self.data_type.width();
        if self.length == 1 {
            return self.data_type.decode_scalar(&words[..width]);
        }
        PointValue::Array(
            words
                .chunks_exact(width)
                .map(|chunk| self.data_type.decode_scalar(chunk))
                .collect(),
        )
    }
}

impl From<&PointConfig> for PointDef {
    fn from(cfg: &PointConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            table: cfg.table,
            start_address: cfg.start_address,
            length: cfg.length,
            data_type: cfg.data_type,
        }
    }
}

/// Immutable name → definition map, iterated in name order
#[derive(Debug, Clone, Default)]
pub struct PointMap {
    points: BTreeMap<String, PointDef>,
}

impl PointMap {
    /// Validate and build the map; any invalid entry fails the whole load
    pub fn load(entries: &[PointConfig], memory: &MemoryConfig) -> Result<Self, ConfigError> {
        let mut points = BTreeMap::new();

        for cfg in entries {
            let def = PointDef::from(cfg);
            Self::check_entry(&def, memory)?;
            if points.contains_key(&def.name) {
                return Err(ConfigError::DuplicatePoint(def.name));
            }
            points.insert(def.name.clone(), def);
        }

        Self::check_overlaps(&points)?;
        debug!("Point map loaded: {} points", points.len());
        Ok(Self { points })
    }

    fn check_entry(def: &PointDef, memory: &MemoryConfig) -> Result<(), ConfigError> {
        if def.name.trim().is_empty() {
            return Err(ConfigError::invalid_point(&def.name, "empty name"));
        }
        if def.length == 0 {
            return Err(ConfigError::invalid_point(&def.name, "length must be >= 1"));
        }
        if !def.data_type.fits(def.table) {
            return Err(ConfigError::invalid_point(
                &def.name,
                format!("data type {} not allowed in {}", def.data_type, def.table),
            ));
        }
        let size = memory.size(def.table);
        if def.end() > size {
            return Err(ConfigError::invalid_point(
                &def.name,
                format!(
                    "range {}..{} exceeds {} size {}",
                    def.start_address,
                    def.end(),
                    def.table,
                    size
                ),
            ));
        }
        Ok(())
    }

    /// Overlapping ranges in one table must share the data type
    fn check_overlaps(points: &BTreeMap<String, PointDef>) -> Result<(), ConfigError> {
        let mut by_table: HashMap<Table, Vec<&PointDef>> = HashMap::new();
        for def in points.values() {
            by_table.entry(def.table).or_default().push(def);
        }

        for defs in by_table.values_mut() {
            defs.sort_by_key(|d| d.start_address);
            for (i, a) in defs.iter().enumerate() {
                for b in &defs[i + 1..] {
                    if usize::from(b.start_address) >= a.end() {
                        break;
                    }
                    if a.data_type != b.data_type {
                        return Err(ConfigError::PointOverlap {
                            first: a.name.clone(),
                            second: b.name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Look up a point by name
    pub fn resolve(&self, name: &str) -> Result<&PointDef, PointError> {
        self.points
            .get(name)
            .ok_or_else(|| PointError::NotFound(name.to_string()))
    }

    /// Entries in name order
    pub fn iter(&self) -> impl Iterator<Item = &PointDef> {
        self.points.values()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn point(name: &str, table: Table, start: u16, length: u16, dt: DataType) -> PointConfig {
        PointConfig {
            name: name.to_string(),
            table,
            start_address: start,
            length,
            data_type: dt,
        }
    }

    fn memory(size: usize) -> MemoryConfig {
        MemoryConfig {
            coils: size,
            discrete_inputs: size,
            input_registers: size,
            holding_registers: size,
            default_value: 0,
        }
    }

    #[test]
    fn test_load_and_resolve() {
        let map = PointMap::load(
            &[
                point("temp1", Table::HoldingRegisters, 100, 1, DataType::U16),
                point("alarm", Table::Coils, 0, 1, DataType::Bool),
            ],
            &memory(200),
        )
        .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.resolve("temp1").unwrap().start_address, 100);
        assert_eq!(
            map.resolve("missing"),
            Err(PointError::NotFound("missing".into()))
        );
        let names: Vec<_> = map.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alarm", "temp1"]);
    }

    #[test]
    fn test_load_rejects_duplicates() {
        let err = PointMap::load(
            &[
                point("p", Table::HoldingRegisters, 0, 1, DataType::U16),
                point("p", Table::HoldingRegisters, 5, 1, DataType::U16),
            ],
            &memory(10),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::DuplicatePoint("p".into()));
    }

    #[test]
    fn test_load_rejects_invalid_entries() {
        let mem = memory(10);
        let cases = [
            point("", Table::HoldingRegisters, 0, 1, DataType::U16),
            point("zero", Table::HoldingRegisters, 0, 0, DataType::U16),
            point("far", Table::HoldingRegisters, 9, 1, DataType::U32),
            point("bool_reg", Table::InputRegisters, 0, 1, DataType::Bool),
            point("u16_bit", Table::Coils, 0, 1, DataType::U16),
            point("arr", Table::HoldingRegisters, 5, 3, DataType::F32),
        ];
        for case in cases {
            assert!(
                matches!(
                    PointMap::load(&[case.clone()], &mem),
                    Err(ConfigError::InvalidPoint { .. })
                ),
                "expected rejection of {:?}",
                case
            );
        }
    }

    #[test]
    fn test_overlap_rules() {
        let mem = memory(100);
        // Same type alias is allowed
        PointMap::load(
            &[
                point("a", Table::HoldingRegisters, 10, 2, DataType::U16),
                point("b", Table::HoldingRegisters, 11, 1, DataType::U16),
            ],
            &mem,
        )
        .unwrap();

        let err = PointMap::load(
            &[
                point("a", Table::HoldingRegisters, 10, 1, DataType::F32),
                point("b", Table::HoldingRegisters, 11, 1, DataType::U16),
            ],
            &mem,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::PointOverlap { .. }));

        // Different tables never overlap
        PointMap::load(
            &[
                point("a", Table::HoldingRegisters, 10, 1, DataType::F32),
                point("b", Table::InputRegisters, 10, 1, DataType::U16),
            ],
            &mem,
        )
        .unwrap();
    }

    #[test]
    fn test_encode_decode_scalars() {
        let def = |dt| PointDef {
            name: "p".into(),
            table: Table::HoldingRegisters,
            start_address: 0,
            length: 1,
            data_type: dt,
        };

        assert_eq!(def(DataType::U16).encode(&PointValue::Int(235)).unwrap(), vec![235]);
        assert_eq!(
            def(DataType::I16).encode(&PointValue::Int(-1)).unwrap(),
            vec![0xFFFF]
        );
        assert_eq!(
            def(DataType::I16).decode(&[0xFFFF]),
            PointValue::Int(-1)
        );
        assert_eq!(
            def(DataType::U32).encode(&PointValue::Int(0x0001_0002)).unwrap(),
            vec![0x0001, 0x0002]
        );
        assert_eq!(
            def(DataType::I32).decode(&[0xFFFF, 0xFFFE]),
            PointValue::Int(-2)
        );
        let words = def(DataType::F32).encode(&PointValue::Float(1.5)).unwrap();
        assert_eq!(words, vec![0x3FC0, 0x0000]);
        assert_eq!(def(DataType::F32).decode(&words), PointValue::Float(1.5));
    }

    #[test]
    fn test_encode_errors() {
        let def = PointDef {
            name: "p".into(),
            table: Table::HoldingRegisters,
            start_address: 0,
            length: 1,
            data_type: DataType::U16,
        };
        assert!(matches!(
            def.encode(&PointValue::Int(70000)),
            Err(PointError::OutOfRange { .. })
        ));
        assert!(matches!(
            def.encode(&PointValue::Int(-1)),
            Err(PointError::OutOfRange { .. })
        ));
        assert!(matches!(
            def.encode(&PointValue::Float(1.5)),
            Err(PointError::TypeMismatch { .. })
        ));
        assert!(matches!(
            def.encode(&PointValue::Array(vec![PointValue::Int(1)])),
            Err(PointError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_array_points() {
        let def = PointDef {
            name: "arr".into(),
            table: Table::HoldingRegisters,
            start_address: 0,
            length: 2,
            data_type: DataType::I32,
        };
        assert_eq!(def.span(), 4);
        let value = PointValue::Array(vec![PointValue::Int(-1), PointValue::Int(7)]);
        let words = def.encode(&value).unwrap();
        assert_eq!(words, vec![0xFFFF, 0xFFFF, 0, 7]);
        assert_eq!(def.decode(&words), value);

        let short = PointValue::Array(vec![PointValue::Int(1)]);
        assert!(matches!(
            def.encode(&short),
            Err(PointError::TypeMismatch { .. })
        ));
        assert!(matches!(
            def.encode(&PointValue::Int(1)),
            Err(PointError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_value_json_shape() {
        let v: PointValue = serde_json::from_str("235").unwrap();
        assert_eq!(v, PointValue::Int(235));
        let v: PointValue = serde_json::from_str("1.25").unwrap();
        assert_eq!(v, PointValue::Float(1.25));
        let v: PointValue = serde_json::from_str("[true, false]").unwrap();
        assert_eq!(
            v,
            PointValue::Array(vec![PointValue::Bool(true), PointValue::Bool(false)])
        );
    }
}
