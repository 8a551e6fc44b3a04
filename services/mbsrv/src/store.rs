//! Shared register memory
//!
//! Four independently addressed tables (coils, discrete inputs, input
//! registers, holding registers). Each table is a fixed arena of cells behind
//! its own `parking_lot::RwLock`; no operation ever holds two table locks.
//! Multi-address writes take the table's write lock once for the whole range,
//! so readers see either none or all of a write.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MemoryConfig;
use crate::error::StoreError;

/// Largest addressable table (16-bit address space)
pub const MAX_TABLE_SIZE: usize = 65536;

/// Modbus object table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    #[serde(alias = "coil")]
    Coils,
    #[serde(alias = "discrete_input", alias = "di")]
    DiscreteInputs,
    #[serde(alias = "input_register", alias = "input", alias = "ir")]
    InputRegisters,
    #[serde(alias = "holding_register", alias = "holding", alias = "hr")]
    HoldingRegisters,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Coils,
        Table::DiscreteInputs,
        Table::InputRegisters,
        Table::HoldingRegisters,
    ];

    #[inline]
    fn index(self) -> usize {
        match self {
            Table::Coils => 0,
            Table::DiscreteInputs => 1,
            Table::InputRegisters => 2,
            Table::HoldingRegisters => 3,
        }
    }

    /// Single-bit table (coils, discrete inputs)
    #[inline]
    pub fn is_bit(self) -> bool {
        matches!(self, Table::Coils | Table::DiscreteInputs)
    }

    /// Writable by Modbus masters
    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self, Table::Coils | Table::HoldingRegisters)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Table::Coils => "coils",
            Table::DiscreteInputs => "discrete_inputs",
            Table::InputRegisters => "input_registers",
            Table::HoldingRegisters => "holding_registers",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coils" | "coil" => Ok(Table::Coils),
            "discrete_inputs" | "discrete_input" | "di" => Ok(Table::DiscreteInputs),
            "input_registers" | "input_register" | "input" | "ir" => Ok(Table::InputRegisters),
            "holding_registers" | "holding_register" | "holding" | "hr" => {
                Ok(Table::HoldingRegisters)
            },
            other => Err(format!("unknown table '{}'", other)),
        }
    }
}

/// Data quality of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Unknown,
    Stale,
    Bad,
}

impl Quality {
    /// Worst of two qualities (Bad > Stale > Unknown > Good)
    #[inline]
    pub fn worst(self, other: Quality) -> Quality {
        self.max(other)
    }
}

#[derive(Debug, Clone, Copy)]
struct Cell {
    value: u16,
    quality: Quality,
    /// Milliseconds since the Unix epoch, 0 = never written
    updated_ms: i64,
}

impl Cell {
    fn initial(value: u16) -> Self {
        Self {
            value,
            quality: Quality::Unknown,
            updated_ms: 0,
        }
    }
}

/// Point-in-time copy of one address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub address: u16,
    pub value: u16,
    pub quality: Quality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

/// The process-wide register memory
#[derive(Debug)]
pub struct RegisterStore {
    tables: [RwLock<Box<[Cell]>>; 4],
    sizes: [usize; 4],
    default_value: u16,
}

impl RegisterStore {
    /// Allocate all four tables at their configured sizes
    pub fn new(config: &MemoryConfig) -> Self {
        let sizes = [
            config.coils,
            config.discrete_inputs,
            config.input_registers,
            config.holding_registers,
        ];
        let default_value = config.default_value;
        let tables = Table::ALL.map(|table| {
            let value = Self::normalize(table, default_value);
            RwLock::new(vec![Cell::initial(value); sizes[table.index()]].into_boxed_slice())
        });

        debug!(
            "Register store allocated: coils={} di={} ir={} hr={} default={}",
            sizes[0], sizes[1], sizes[2], sizes[3], default_value
        );

        Self {
            tables,
            sizes,
            default_value,
        }
    }

    #[inline]
    fn normalize(table: Table, value: u16) -> u16 {
        if table.is_bit() {
            u16::from(value != 0)
        } else {
            value
        }
    }

    /// Bounds check, returns the index range on success
    fn range(
        &self,
        table: Table,
        start: u16,
        count: usize,
    ) -> Result<std::ops::Range<usize>, StoreError> {
        let size = self.sizes[table.index()];
        let begin = usize::from(start);
        match begin.checked_add(count) {
            Some(end) if count > 0 && end <= size => Ok(begin..end),
            _ => Err(StoreError::OutOfRange {
                table,
                start,
                count,
                size,
            }),
        }
    }

    /// Size of one table
    #[inline]
    pub fn size(&self, table: Table) -> usize {
        self.sizes[table.index()]
    }

    /// Sizes of all tables, in [`Table::ALL`] order
    pub fn sizes(&self) -> [(Table, usize); 4] {
        Table::ALL.map(|t| (t, self.size(t)))
    }

    /// Snapshot copy of `count` values starting at `start`
    pub fn read(&self, table: Table, start: u16, count: usize) -> Result<Vec<u16>, StoreError> {
        let range = self.range(table, start, count)?;
        let cells = self.tables[table.index()].read();
        Ok(cells[range].iter().map(|c| c.value).collect())
    }

    /// Snapshot copy including quality and timestamps
    pub fn read_cells(
        &self,
        table: Table,
        start: u16,
        count: usize,
    ) -> Result<Vec<CellSnapshot>, StoreError> {
        let range = self.range(table, start, count)?;
        let cells = self.tables[table.index()].read();
        Ok(cells[range.clone()]
            .iter()
            .zip(range)
            .map(|(c, addr)| CellSnapshot {
                address: addr as u16,
                value: c.value,
                quality: c.quality,
                updated_at: ms_to_datetime(c.updated_ms),
            })
            .collect())
    }

    /// Master write: discrete inputs and input registers are rejected
    pub fn write(&self, table: Table, start: u16, values: &[u16]) -> Result<(), StoreError> {
        if !table.is_writable() {
            return Err(StoreError::NotWritable(table));
        }
        self.load(table, start, values)
    }

    /// Privileged write that ignores table writability
    ///
    /// Same bounds and atomicity rules as [`RegisterStore::write`]; every
    /// address is applied under one exclusive lock.
    pub fn load(&self, table: Table, start: u16, values: &[u16]) -> Result<(), StoreError> {
        let range = self.range(table, start, values.len())?;
        let now = Utc::now().timestamp_millis();
        let mut cells = self.tables[table.index()].write();
        for (cell, &value) in cells[range].iter_mut().zip(values) {
            cell.value = Self::normalize(table, value);
            cell.quality = Quality::Good;
            cell.updated_ms = now;
        }
        Ok(())
    }

    /// Override the quality of a range without touching values
    pub fn set_quality(
        &self,
        table: Table,
        start: u16,
        count: usize,
        quality: Quality,
    ) -> Result<(), StoreError> {
        let range = self.range(table, start, count)?;
        let now = Utc::now().timestamp_millis();
        let mut cells = self.tables[table.index()].write();
        for cell in &mut cells[range] {
            cell.quality = quality;
            cell.updated_ms = now;
        }
        Ok(())
    }

    /// Addresses whose timestamp is strictly newer than `since`
    pub fn changed_since(&self, table: Table, since: DateTime<Utc>) -> Vec<u16> {
        let since_ms = since.timestamp_millis();
        let cells = self.tables[table.index()].read();
        cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.updated_ms > since_ms)
            .map(|(addr, _)| addr as u16)
            .collect()
    }

    /// Restore every table to the configured default with `Unknown` quality
    pub fn reset(&self) {
        for table in Table::ALL {
            let initial = Cell::initial(Self::normalize(table, self.default_value));
            self.tables[table.index()].write().fill(initial);
        }
        debug!("Register store reset to default value {}", self.default_value);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store_with(size: usize, default_value: u16) -> RegisterStore {
        RegisterStore::new(&MemoryConfig {
            coils: size,
            discrete_inputs: size,
            input_registers: size,
            holding_registers: size,
            default_value,
        })
    }

    #[test]
    fn test_write_then_read_every_table() {
        let store = store_with(16, 0);
        for table in [Table::Coils, Table::HoldingRegisters] {
            store.write(table, 3, &[1, 0, 1]).unwrap();
            assert_eq!(store.read(table, 3, 3).unwrap(), vec![1, 0, 1]);
        }
        for table in [Table::DiscreteInputs, Table::InputRegisters] {
            store.load(table, 0, &[1, 1]).unwrap();
            assert_eq!(store.read(table, 0, 2).unwrap(), vec![1, 1]);
        }
    }

    #[test]
    fn test_size_ten_scenario() {
        let store = store_with(10, 0);
        store.write(Table::HoldingRegisters, 2, &[5, 6, 7]).unwrap();
        assert_eq!(
            store.read(Table::HoldingRegisters, 0, 10).unwrap(),
            vec![0, 0, 5, 6, 7, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_out_of_range_never_panics() {
        let store = store_with(10, 0);
        assert!(matches!(
            store.read(Table::HoldingRegisters, 9, 2),
            Err(StoreError::OutOfRange { size: 10, .. })
        ));
        assert!(store.read(Table::Coils, 10, 1).is_err());
        assert!(store.read(Table::Coils, 0, 0).is_err());
        assert!(store.read(Table::Coils, u16::MAX, usize::MAX).is_err());
        assert!(store.write(Table::HoldingRegisters, 8, &[1, 2, 3]).is_err());
        // The failed write left nothing behind
        assert_eq!(store.read(Table::HoldingRegisters, 8, 2).unwrap(), vec![0, 0]);
        assert!(store.set_quality(Table::Coils, 11, 1, Quality::Bad).is_err());
    }

    #[test]
    fn test_input_tables_reject_master_writes() {
        let store = store_with(10, 0);
        assert_eq!(
            store.write(Table::DiscreteInputs, 0, &[1]),
            Err(StoreError::NotWritable(Table::DiscreteInputs))
        );
        assert_eq!(
            store.write(Table::InputRegisters, 0, &[1]),
            Err(StoreError::NotWritable(Table::InputRegisters))
        );
    }

    #[test]
    fn test_bit_tables_normalize_values() {
        let store = store_with(4, 7);
        assert_eq!(store.read(Table::Coils, 0, 1).unwrap(), vec![1]);
        assert_eq!(store.read(Table::HoldingRegisters, 0, 1).unwrap(), vec![7]);
        store.write(Table::Coils, 0, &[0, 0x1234]).unwrap();
        assert_eq!(store.read(Table::Coils, 0, 2).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_quality_and_timestamps() {
        let store = store_with(8, 0);
        let cells = store.read_cells(Table::HoldingRegisters, 0, 2).unwrap();
        assert!(cells.iter().all(|c| c.quality == Quality::Unknown));
        assert!(cells.iter().all(|c| c.updated_at.is_none()));

        let before = Utc::now() - chrono::Duration::milliseconds(5);
        store.write(Table::HoldingRegisters, 1, &[42]).unwrap();
        let cells = store.read_cells(Table::HoldingRegisters, 0, 2).unwrap();
        assert_eq!(cells[1].address, 1);
        assert_eq!(cells[1].value, 42);
        assert_eq!(cells[1].quality, Quality::Good);
        assert!(cells[1].updated_at.is_some());
        assert_eq!(
            store.changed_since(Table::HoldingRegisters, before),
            vec![1]
        );

        store
            .set_quality(Table::HoldingRegisters, 1, 1, Quality::Stale)
            .unwrap();
        let cells = store.read_cells(Table::HoldingRegisters, 1, 1).unwrap();
        assert_eq!(cells[0].quality, Quality::Stale);
        assert_eq!(cells[0].value, 42);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let store = store_with(4, 3);
        store.write(Table::HoldingRegisters, 0, &[9, 9, 9, 9]).unwrap();
        store.reset();
        assert_eq!(
            store.read(Table::HoldingRegisters, 0, 4).unwrap(),
            vec![3, 3, 3, 3]
        );
        let cells = store.read_cells(Table::HoldingRegisters, 0, 1).unwrap();
        assert_eq!(cells[0].quality, Quality::Unknown);
    }

    #[test]
    fn test_sizes() {
        let store = RegisterStore::new(&MemoryConfig {
            coils: 1,
            discrete_inputs: 2,
            input_registers: 3,
            holding_registers: MAX_TABLE_SIZE,
            default_value: 0,
        });
        assert_eq!(store.size(Table::DiscreteInputs), 2);
        assert_eq!(store.sizes()[3], (Table::HoldingRegisters, MAX_TABLE_SIZE));
        // Last address of a full table is reachable
        store.write(Table::HoldingRegisters, u16::MAX, &[1]).unwrap();
    }

    #[test]
    fn test_table_parse() {
        assert_eq!("hr".parse::<Table>().unwrap(), Table::HoldingRegisters);
        assert_eq!("Coils".parse::<Table>().unwrap(), Table::Coils);
        assert!("registers".parse::<Table>().is_err());
        assert_eq!(Quality::Good.worst(Quality::Stale), Quality::Stale);
    }

    #[test]
    fn test_concurrent_reader_sees_whole_writes() {
        let store = Arc::new(store_with(64, 0));
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for round in 1..=500u16 {
                    store
                        .write(Table::HoldingRegisters, 0, &[round; 64])
                        .unwrap();
                }
            })
        };
        let reader = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let values = store.read(Table::HoldingRegisters, 0, 64).unwrap();
                    assert!(
                        values.iter().all(|v| *v == values[0]),
                        "torn read: {:?}",
                        values
                    );
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
