//! HTTP access façade
//!
//! Named-point and raw-address access to the register store for the control
//! plane. Writes into discrete inputs and input registers are gated by
//! `policy.http_write_inputs`.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PolicyConfig;
use crate::error::{PointError, StoreError};
use crate::point_map::{DataType, PointMap, PointValue};
use crate::store::{CellSnapshot, Quality, RegisterStore, Table};

/// Current value of a named point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointReading {
    pub name: String,
    pub table: Table,
    pub start_address: u16,
    pub data_type: DataType,
    pub length: u16,
    pub value: PointValue,
    /// Raw register words backing the value
    pub raw: Vec<u16>,
    /// Worst quality across the point's addresses
    pub quality: Quality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Static description of a configured point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDescriptor {
    pub name: String,
    pub table: Table,
    pub start_address: u16,
    pub length: u16,
    pub data_type: DataType,
    /// Whether the HTTP surface may write it under the current policy
    pub writable: bool,
}

/// Point and table access for the HTTP layer
#[derive(Debug, Clone)]
pub struct Facade {
    store: Arc<RegisterStore>,
    points: Arc<ArcSwap<PointMap>>,
    policy: PolicyConfig,
}

impl Facade {
    pub fn new(
        store: Arc<RegisterStore>,
        points: Arc<ArcSwap<PointMap>>,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            store,
            points,
            policy,
        }
    }

    fn http_writable(&self, table: Table) -> bool {
        table.is_writable() || self.policy.http_write_inputs
    }

    /// Policy-aware write used by every HTTP write path
    fn apply(&self, table: Table, start: u16, values: &[u16]) -> Result<(), StoreError> {
        if table.is_writable() {
            self.store.write(table, start, values)
        } else if self.policy.http_write_inputs {
            self.store.load(table, start, values)
        } else {
            Err(StoreError::NotWritable(table))
        }
    }

    /// Read a point as one consistent snapshot of its addresses
    pub fn get_point(&self, name: &str) -> Result<PointReading, PointError> {
        let points = self.points.load();
        let def = points.resolve(name)?;
        let cells = self
            .store
            .read_cells(def.table, def.start_address, def.span())?;

        let raw: Vec<u16> = cells.iter().map(|c| c.value).collect();
        let quality = cells
            .iter()
            .fold(Quality::Good, |q, c| q.worst(c.quality));
        let updated_at = cells.iter().filter_map(|c| c.updated_at).max();

        Ok(PointReading {
            name: def.name.clone(),
            table: def.table,
            start_address: def.start_address,
            data_type: def.data_type,
            length: def.length,
            value: def.decode(&raw),
            raw,
            quality,
            updated_at,
        })
    }

    /// Write a point; the value must fit its declared type and length
    pub fn set_point(&self, name: &str, value: &PointValue) -> Result<(), PointError> {
        let points = self.points.load();
        let def = points.resolve(name)?;
        if !self.http_writable(def.table) {
            return Err(PointError::NotWritable(def.name.clone()));
        }
        let words = def.encode(value)?;
        self.apply(def.table, def.start_address, &words)?;
        debug!("Point {} <- {:?}", def.name, value);
        Ok(())
    }

    /// Every configured point, in name order
    pub fn list_points(&self) -> Vec<PointDescriptor> {
        self.points
            .load()
            .iter()
            .map(|def| PointDescriptor {
                name: def.name.clone(),
                table: def.table,
                start_address: def.start_address,
                length: def.length,
                data_type: def.data_type,
                writable: self.http_writable(def.table),
            })
            .collect()
    }

    /// Raw address read
    pub fn read_table(
        &self,
        table: Table,
        start: u16,
        count: usize,
    ) -> Result<Vec<CellSnapshot>, PointError> {
        Ok(self.store.read_cells(table, start, count)?)
    }

    /// Raw address write, same policy as [`Facade::set_point`]
    pub fn write_table(&self, table: Table, start: u16, values: &[u16]) -> Result<(), PointError> {
        self.apply(table, start, values)?;
        debug!("{}[{}..+{}] written", table, start, values.len());
        Ok(())
    }

    /// Mark a raw range with a quality, any table; values are untouched
    pub fn set_quality(
        &self,
        table: Table,
        start: u16,
        count: usize,
        quality: Quality,
    ) -> Result<(), PointError> {
        self.store.set_quality(table, start, count, quality)?;
        debug!("{}[{}..+{}] quality {:?}", table, start, count, quality);
        Ok(())
    }

    /// Addresses of `table` updated after `since`
    pub fn changed_since(&self, table: Table, since: DateTime<Utc>) -> Vec<u16> {
        self.store.changed_since(table, since)
    }

    pub fn table_size(&self, table: Table) -> usize {
        self.store.size(table)
    }

    pub fn point_count(&self) -> usize {
        self.points.load().len()
    }
}
