//! Per-computation result buffers
//!
//! Numeric schemas store one [`NumericColumn`] per element spec, each a
//! window of rows over a [`SharedRegion`]. Opaque schemas keep a plain list
//! of values, one slot per emitted frame.

use crate::error::{RegistryError, ResourceError, TrajparError};
use crate::schema::{Element, NumericSpec, ResultSchema, Value};
use crate::shm::{RegionHandle, SharedRegion};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A per-frame value that does not fit the registered schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMismatch {
    pub expected: String,
    pub found: String,
}

/// Rows of one numeric result, backed by a shared region
#[derive(Debug)]
pub struct NumericColumn {
    spec: NumericSpec,
    region: SharedRegion,
    /// First row of the region covered by this column
    row_offset: usize,
    rows: usize,
}

impl NumericColumn {
    fn allocate(spec: &NumericSpec, rows: usize, dir: &Path) -> Result<Self, ResourceError> {
        let region = SharedRegion::create(dir, rows * spec.row_bytes())?;
        Ok(Self {
            spec: spec.clone(),
            region,
            row_offset: 0,
            rows,
        })
    }

    fn rebind(
        spec: &NumericSpec,
        handle: &RegionHandle,
        row_offset: usize,
        rows: usize,
    ) -> Result<Self, ResourceError> {
        let needed = (row_offset + rows) * spec.row_bytes();
        if handle.len < needed {
            return Err(ResourceError::RegionSize {
                path: handle.path.clone(),
                expected: needed,
                actual: handle.len,
            });
        }
        Ok(Self {
            spec: spec.clone(),
            region: SharedRegion::open(handle)?,
            row_offset,
            rows,
        })
    }

    pub fn spec(&self) -> &NumericSpec {
        &self.spec
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Handle of the backing region
    pub fn handle(&self) -> RegionHandle {
        self.region.handle()
    }

    /// Raw bytes of the rows covered by this column
    pub fn bytes(&self) -> &[u8] {
        let rb = self.spec.row_bytes();
        if self.rows == 0 || rb == 0 {
            return &[];
        }
        &self.region.bytes()[self.row_offset * rb..(self.row_offset + self.rows) * rb]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let rb = self.spec.row_bytes();
        if self.rows == 0 || rb == 0 {
            return &mut [];
        }
        &mut self.region.bytes_mut()[self.row_offset * rb..(self.row_offset + self.rows) * rb]
    }

    /// Typed view of all rows, flattened row-major
    ///
    /// Returns `None` if `T` does not match the column's element kind.
    pub fn values<T: Element>(&self) -> Option<&[T]> {
        if T::KIND != self.spec.kind {
            return None;
        }
        let bytes = self.bytes();
        if bytes.is_empty() {
            return Some(&[]);
        }
        bytemuck::try_cast_slice(bytes).ok()
    }

    /// Typed view of one row
    pub fn row<T: Element>(&self, row: usize) -> Option<&[T]> {
        let per_row = self.spec.elements();
        self.values::<T>()?.get(row * per_row..(row + 1) * per_row)
    }

    fn write_row(&mut self, row: usize, data: &[u8]) {
        let rb = self.spec.row_bytes();
        self.bytes_mut()[row * rb..(row + 1) * rb].copy_from_slice(data);
    }

    /// Copy `data` over consecutive rows starting at `row`
    fn write_rows(&mut self, row: usize, data: &[u8]) -> Result<(), ResourceError> {
        let rb = self.spec.row_bytes();
        let start = row * rb;
        let end = start + data.len();
        if end > self.bytes().len() {
            return Err(ResourceError::RegionSize {
                path: self.handle().path,
                expected: (self.row_offset * rb) + end,
                actual: self.region.len(),
            });
        }
        self.bytes_mut()[start..end].copy_from_slice(data);
        Ok(())
    }

    fn permute(&mut self, order: &[usize]) {
        let rb = self.spec.row_bytes();
        let old = self.bytes().to_vec();
        let dst = self.bytes_mut();
        for (new_row, &old_row) in order.iter().enumerate() {
            dst[new_row * rb..(new_row + 1) * rb]
                .copy_from_slice(&old[old_row * rb..(old_row + 1) * rb]);
        }
    }
}

/// Serializable contents of a buffer, used to ship results between ranks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BufferPayload {
    /// Raw row bytes per column
    Numeric(Vec<Vec<u8>>),
    Plain(Vec<Value>),
}

/// Storage for the emitted results of one computation
#[derive(Debug)]
pub enum ResultBuffer {
    Numeric(Vec<NumericColumn>),
    Plain(Vec<Value>),
}

impl ResultBuffer {
    /// Allocate storage for `rows` frames
    ///
    /// Numeric columns get fresh zeroed regions in `dir`.
    pub fn allocate(schema: &ResultSchema, rows: usize, dir: &Path) -> Result<Self, ResourceError> {
        if !schema.is_numeric() {
            return Ok(ResultBuffer::Plain(vec![Value::None; rows]));
        }
        let columns = schema
            .columns()
            .iter()
            .map(|spec| NumericColumn::allocate(spec, rows, dir))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResultBuffer::Numeric(columns))
    }

    /// View `rows` rows starting at `row_offset` of regions created elsewhere
    ///
    /// Opaque schemas take no handles and get a fresh local list.
    pub fn rebind(
        name: &str,
        schema: &ResultSchema,
        handles: &[RegionHandle],
        row_offset: usize,
        rows: usize,
    ) -> Result<Self, TrajparError> {
        let specs = schema.columns();
        if handles.len() != specs.len() {
            return Err(RegistryError::HandleMismatch {
                name: name.to_string(),
                expected: specs.len(),
                got: handles.len(),
            }
            .into());
        }
        if !schema.is_numeric() {
            return Ok(ResultBuffer::Plain(vec![Value::None; rows]));
        }
        let columns = specs
            .iter()
            .zip(handles)
            .map(|(spec, handle)| NumericColumn::rebind(spec, handle, row_offset, rows))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResultBuffer::Numeric(columns))
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        match self {
            ResultBuffer::Numeric(columns) => columns.first().map_or(0, NumericColumn::rows),
            ResultBuffer::Plain(values) => values.len(),
        }
    }

    /// Region handles, one per numeric column
    pub fn handles(&self) -> Vec<RegionHandle> {
        match self {
            ResultBuffer::Numeric(columns) => columns.iter().map(NumericColumn::handle).collect(),
            ResultBuffer::Plain(_) => Vec::new(),
        }
    }

    pub fn columns(&self) -> &[NumericColumn] {
        match self {
            ResultBuffer::Numeric(columns) => columns,
            ResultBuffer::Plain(_) => &[],
        }
    }

    /// Plain values, if this buffer is opaque
    pub fn plain(&self) -> Option<&[Value]> {
        match self {
            ResultBuffer::Plain(values) => Some(values),
            ResultBuffer::Numeric(_) => None,
        }
    }

    /// Store the value of one emitted frame at `slot`
    pub fn write(&mut self, slot: usize, value: Value) -> Result<(), SchemaMismatch> {
        match self {
            ResultBuffer::Plain(values) => {
                values[slot] = value;
                Ok(())
            }
            ResultBuffer::Numeric(columns) if columns.len() == 1 && !is_list(&value) => {
                write_numeric(&mut columns[0], slot, &value)
            }
            ResultBuffer::Numeric(columns) => {
                let expected = || {
                    let specs: Vec<String> =
                        columns.iter().map(|c| c.spec().to_string()).collect();
                    format!("({})", specs.join(", "))
                };
                let items = match &value {
                    Value::List(items) if items.len() == columns.len() => items,
                    _ => {
                        return Err(SchemaMismatch {
                            expected: expected(),
                            found: value.describe(),
                        })
                    }
                };
                // Check every element before touching any column
                for (column, item) in columns.iter().zip(items) {
                    match item.numeric() {
                        Some((spec, _)) if spec == column.spec => {}
                        _ => {
                            return Err(SchemaMismatch {
                                expected: expected(),
                                found: item.describe(),
                            })
                        }
                    }
                }
                for (column, item) in columns.iter_mut().zip(items) {
                    write_numeric(column, slot, item)?;
                }
                Ok(())
            }
        }
    }

    /// Copy the contents out for shipping to another rank
    pub fn to_payload(&self) -> BufferPayload {
        match self {
            ResultBuffer::Numeric(columns) => {
                BufferPayload::Numeric(columns.iter().map(|c| c.bytes().to_vec()).collect())
            }
            ResultBuffer::Plain(values) => BufferPayload::Plain(values.clone()),
        }
    }

    /// Take the plain values out, leaving numeric buffers empty-handed
    pub fn take_plain(&mut self) -> Vec<Value> {
        match self {
            ResultBuffer::Plain(values) => std::mem::take(values),
            ResultBuffer::Numeric(_) => Vec::new(),
        }
    }

    /// Copy a payload from another worker in at `row`
    pub fn write_payload(&mut self, row: usize, payload: BufferPayload) -> Result<(), TrajparError> {
        match (self, payload) {
            (ResultBuffer::Numeric(columns), BufferPayload::Numeric(parts)) => {
                if parts.len() != columns.len() {
                    return Err(ResourceError::Region {
                        path: columns.first().map(|c| c.handle().path).unwrap_or_default(),
                        reason: format!(
                            "payload has {} columns, buffer has {}",
                            parts.len(),
                            columns.len()
                        ),
                    }
                    .into());
                }
                for (column, bytes) in columns.iter_mut().zip(parts) {
                    column.write_rows(row, &bytes)?;
                }
                Ok(())
            }
            (ResultBuffer::Plain(values), BufferPayload::Plain(parts)) => {
                let end = row + parts.len();
                if end > values.len() {
                    values.resize(end, Value::None);
                }
                for (slot, value) in values[row..end].iter_mut().zip(parts) {
                    *slot = value;
                }
                Ok(())
            }
            _ => Err(ResourceError::Region {
                path: Default::default(),
                reason: "payload kind does not match buffer kind".into(),
            }
            .into()),
        }
    }

    /// Reorder rows so that new row `i` is old row `order[i]`
    pub fn permute(&mut self, order: &[usize]) {
        match self {
            ResultBuffer::Numeric(columns) => {
                for column in columns {
                    column.permute(order);
                }
            }
            ResultBuffer::Plain(values) => {
                let old = std::mem::take(values);
                let mut old: Vec<Option<Value>> = old.into_iter().map(Some).collect();
                *values = order
                    .iter()
                    .map(|&i| old[i].take().unwrap_or(Value::None))
                    .collect();
            }
        }
    }

    /// Flush numeric columns so other mappings observe every write
    pub fn flush(&self) -> Result<(), ResourceError> {
        for column in self.columns() {
            column.region.flush()?;
        }
        Ok(())
    }
}

fn is_list(value: &Value) -> bool {
    matches!(value, Value::List(_))
}

fn write_numeric(column: &mut NumericColumn, slot: usize, value: &Value) -> Result<(), SchemaMismatch> {
    match value.numeric() {
        Some((spec, bytes)) if spec == column.spec => {
            column.write_row(slot, &bytes);
            Ok(())
        }
        _ => Err(SchemaMismatch {
            expected: column.spec.to_string(),
            found: value.describe(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{NumericKind, NumericSpec};
    use tempfile::tempdir;

    fn scalar_f32() -> ResultSchema {
        ResultSchema::Numeric(NumericSpec::new(NumericKind::F32, vec![]))
    }

    #[test]
    fn test_numeric_write_and_read() {
        let dir = tempdir().unwrap();
        let mut buf = ResultBuffer::allocate(&scalar_f32(), 3, dir.path()).unwrap();
        buf.write(1, Value::F32(2.5)).unwrap();
        assert_eq!(buf.columns()[0].values::<f32>().unwrap(), &[0.0, 2.5, 0.0]);
        assert!(buf.columns()[0].values::<f64>().is_none());
    }

    #[test]
    fn test_schema_violation() {
        let dir = tempdir().unwrap();
        let mut buf = ResultBuffer::allocate(&scalar_f32(), 2, dir.path()).unwrap();
        let err = buf.write(0, Value::F64(1.0)).unwrap_err();
        assert_eq!(err.found, "float64 scalar");

        let shaped = ResultSchema::Numeric(NumericSpec::new(NumericKind::F32, vec![3]));
        let mut buf = ResultBuffer::allocate(&shaped, 2, dir.path()).unwrap();
        assert!(buf.write(0, Value::array_f32(vec![2], vec![1.0, 2.0])).is_err());
    }

    #[test]
    fn test_rebind_writes_into_parent() {
        let dir = tempdir().unwrap();
        let schema = ResultSchema::Numeric(NumericSpec::new(NumericKind::F64, vec![2]));
        let parent = ResultBuffer::allocate(&schema, 4, dir.path()).unwrap();

        let mut child = ResultBuffer::rebind("f", &schema, &parent.handles(), 2, 2).unwrap();
        child.write(1, Value::array_f64(vec![2], vec![7.0, 8.0])).unwrap();
        child.flush().unwrap();

        let col = &parent.columns()[0];
        assert_eq!(col.row::<f64>(3).unwrap(), &[7.0, 8.0]);
        assert_eq!(col.row::<f64>(0).unwrap(), &[0.0, 0.0]);
    }

    #[test]
    fn test_rebind_handle_count() {
        let schema = scalar_f32();
        assert!(matches!(
            ResultBuffer::rebind("f", &schema, &[], 0, 1),
            Err(TrajparError::Registry(RegistryError::HandleMismatch { .. }))
        ));
    }

    #[test]
    fn test_composite_write() {
        let dir = tempdir().unwrap();
        let schema = ResultSchema::Composite(vec![
            NumericSpec::new(NumericKind::I32, vec![]),
            NumericSpec::new(NumericKind::F32, vec![2]),
        ]);
        let mut buf = ResultBuffer::allocate(&schema, 2, dir.path()).unwrap();
        let v = Value::List(vec![Value::I32(4), Value::array_f32(vec![2], vec![1.0, 2.0])]);
        buf.write(1, v).unwrap();
        assert_eq!(buf.columns()[0].values::<i32>().unwrap(), &[0, 4]);
        assert_eq!(buf.columns()[1].row::<f32>(1).unwrap(), &[1.0, 2.0]);

        // a bad element leaves every column untouched
        let bad = Value::List(vec![Value::I32(9), Value::F32(1.0)]);
        assert!(buf.write(0, bad).is_err());
        assert_eq!(buf.columns()[0].values::<i32>().unwrap(), &[0, 4]);
    }

    #[test]
    fn test_payload_and_permute() {
        let dir = tempdir().unwrap();
        let mut local = ResultBuffer::allocate(&scalar_f32(), 2, dir.path()).unwrap();
        local.write(0, Value::F32(1.0)).unwrap();
        local.write(1, Value::F32(2.0)).unwrap();

        let mut global = ResultBuffer::allocate(&scalar_f32(), 3, dir.path()).unwrap();
        global.write(0, Value::F32(9.0)).unwrap();
        global.write_payload(1, local.to_payload()).unwrap();
        assert_eq!(global.columns()[0].values::<f32>().unwrap(), &[9.0, 1.0, 2.0]);

        global.permute(&[2, 0, 1]);
        assert_eq!(global.columns()[0].values::<f32>().unwrap(), &[2.0, 9.0, 1.0]);
    }

    #[test]
    fn test_plain_buffer() {
        let dir = tempdir().unwrap();
        let mut buf = ResultBuffer::allocate(&ResultSchema::Opaque, 2, dir.path()).unwrap();
        buf.write(1, Value::Text("b".into())).unwrap();
        assert_eq!(buf.plain().unwrap(), &[Value::None, Value::Text("b".into())]);
        assert!(buf.handles().is_empty());
        buf.permute(&[1, 0]);
        assert_eq!(buf.take_plain()[0], Value::Text("b".into()));
    }
}
