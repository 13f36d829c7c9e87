//! Per-frame result values and their schemas
//!
//! A computation returns a [`Value`] for every frame. Its [`ResultSchema`]
//! decides where those values go:
//!
//! - `Numeric`: one fixed-shape numeric array per frame, written straight
//!   into a shared typed buffer
//! - `Composite`: a fixed tuple of numeric arrays, one buffer per element
//! - `Opaque`: anything else, kept as an ordered list of values
//!
//! Schemas are declared by the caller or inferred once from a probe value
//! with [`infer`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a numeric buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumericKind {
    F32,
    F64,
    I32,
    I64,
    U8,
}

impl NumericKind {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            NumericKind::F32 | NumericKind::I32 => 4,
            NumericKind::F64 | NumericKind::I64 => 8,
            NumericKind::U8 => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NumericKind::F32 => "float32",
            NumericKind::F64 => "float64",
            NumericKind::I32 => "int32",
            NumericKind::I64 => "int64",
            NumericKind::U8 => "uint8",
        }
    }
}

impl fmt::Display for NumericKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rust element types that can live in a numeric buffer
pub trait Element: bytemuck::Pod + Send + Sync {
    const KIND: NumericKind;
}

impl Element for f32 {
    const KIND: NumericKind = NumericKind::F32;
}

impl Element for f64 {
    const KIND: NumericKind = NumericKind::F64;
}

impl Element for i32 {
    const KIND: NumericKind = NumericKind::I32;
}

impl Element for i64 {
    const KIND: NumericKind = NumericKind::I64;
}

impl Element for u8 {
    const KIND: NumericKind = NumericKind::U8;
}

/// Flat numeric storage of an array value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NumericData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
}

impl NumericData {
    pub fn kind(&self) -> NumericKind {
        match self {
            NumericData::F32(_) => NumericKind::F32,
            NumericData::F64(_) => NumericKind::F64,
            NumericData::I32(_) => NumericKind::I32,
            NumericData::I64(_) => NumericKind::I64,
            NumericData::U8(_) => NumericKind::U8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            NumericData::F32(v) => v.len(),
            NumericData::F64(v) => v.len(),
            NumericData::I32(v) => v.len(),
            NumericData::I64(v) => v.len(),
            NumericData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Native-endian bytes of the elements
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            NumericData::F32(v) => bytemuck::cast_slice(v),
            NumericData::F64(v) => bytemuck::cast_slice(v),
            NumericData::I32(v) => bytemuck::cast_slice(v),
            NumericData::I64(v) => bytemuck::cast_slice(v),
            NumericData::U8(v) => v,
        }
    }
}

/// A value returned by a computation for one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    F32(f32),
    F64(f64),
    I32(i32),
    I64(i64),
    U8(u8),
    /// Row-major numeric array
    Array { shape: Vec<usize>, data: NumericData },
    Text(String),
    List(Vec<Value>),
    None,
}

impl Value {
    /// Numeric array from `f32` data
    pub fn array_f32(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Value::Array {
            shape,
            data: NumericData::F32(data),
        }
    }

    /// Numeric array from `f64` data
    pub fn array_f64(shape: Vec<usize>, data: Vec<f64>) -> Self {
        Value::Array {
            shape,
            data: NumericData::F64(data),
        }
    }

    /// Short description used in error messages
    pub fn describe(&self) -> String {
        match self {
            Value::F32(_) => "float32 scalar".into(),
            Value::F64(_) => "float64 scalar".into(),
            Value::I32(_) => "int32 scalar".into(),
            Value::I64(_) => "int64 scalar".into(),
            Value::U8(_) => "uint8 scalar".into(),
            Value::Array { shape, data } => format!("{} array {:?}", data.kind(), shape),
            Value::Text(_) => "text".into(),
            Value::List(items) => format!("list of {}", items.len()),
            Value::None => "none".into(),
        }
    }

    /// Numeric view of this value as `(spec, native bytes)`
    ///
    /// Returns `None` for non-numeric values and for arrays whose shape does
    /// not match their data length.
    pub fn numeric(&self) -> Option<(NumericSpec, NumericBytes<'_>)> {
        let scalar = |kind| NumericSpec {
            kind,
            shape: Vec::new(),
        };
        match self {
            Value::F32(v) => Some((scalar(NumericKind::F32), NumericBytes::Owned(v.to_ne_bytes().to_vec()))),
            Value::F64(v) => Some((scalar(NumericKind::F64), NumericBytes::Owned(v.to_ne_bytes().to_vec()))),
            Value::I32(v) => Some((scalar(NumericKind::I32), NumericBytes::Owned(v.to_ne_bytes().to_vec()))),
            Value::I64(v) => Some((scalar(NumericKind::I64), NumericBytes::Owned(v.to_ne_bytes().to_vec()))),
            Value::U8(v) => Some((scalar(NumericKind::U8), NumericBytes::Owned(vec![*v]))),
            Value::Array { shape, data } => {
                let expected: usize = shape.iter().product();
                if expected != data.len() {
                    return None;
                }
                Some((
                    NumericSpec {
                        kind: data.kind(),
                        shape: shape.clone(),
                    },
                    NumericBytes::Borrowed(data.as_bytes()),
                ))
            }
            _ => None,
        }
    }
}

/// Bytes of a numeric value, borrowed for arrays and owned for scalars
#[derive(Debug)]
pub enum NumericBytes<'a> {
    Borrowed(&'a [u8]),
    Owned(Vec<u8>),
}

impl std::ops::Deref for NumericBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            NumericBytes::Borrowed(b) => b,
            NumericBytes::Owned(v) => v,
        }
    }
}

/// Element type and per-frame shape of a numeric result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NumericSpec {
    pub kind: NumericKind,
    /// Per-frame shape; empty for scalars
    pub shape: Vec<usize>,
}

impl NumericSpec {
    pub fn new(kind: NumericKind, shape: Vec<usize>) -> Self {
        Self { kind, shape }
    }

    /// Elements per frame
    pub fn elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes per frame
    pub fn row_bytes(&self) -> usize {
        self.elements() * self.kind.size()
    }
}

impl fmt::Display for NumericSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.kind, self.shape)
    }
}

/// How the results of a computation are stored
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultSchema {
    /// Fixed-shape numeric array per frame
    Numeric(NumericSpec),
    /// Fixed tuple of numeric arrays per frame
    Composite(Vec<NumericSpec>),
    /// Opaque per-frame values
    Opaque,
}

impl ResultSchema {
    /// Numeric buffers needed, one per column
    pub fn columns(&self) -> &[NumericSpec] {
        match self {
            ResultSchema::Numeric(spec) => std::slice::from_ref(spec),
            ResultSchema::Composite(specs) => specs,
            ResultSchema::Opaque => &[],
        }
    }

    /// Whether results go to typed shared buffers
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ResultSchema::Opaque)
    }

    /// Per-frame shape; opaque results count as one element
    pub fn shape(&self) -> Vec<usize> {
        match self {
            ResultSchema::Numeric(spec) => spec.shape.clone(),
            ResultSchema::Composite(specs) => vec![specs.len()],
            ResultSchema::Opaque => vec![1],
        }
    }

    /// Bytes of typed buffer per frame
    pub fn row_bytes(&self) -> usize {
        self.columns().iter().map(NumericSpec::row_bytes).sum()
    }
}

impl fmt::Display for ResultSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultSchema::Numeric(spec) => write!(f, "{spec}"),
            ResultSchema::Composite(specs) => {
                let parts: Vec<String> = specs.iter().map(ToString::to_string).collect();
                write!(f, "({})", parts.join(", "))
            }
            ResultSchema::Opaque => write!(f, "plain [1]"),
        }
    }
}

/// Infer the schema of a computation from one of its results
///
/// Any element that cannot be mapped to a numeric kind degrades the whole
/// result to [`ResultSchema::Opaque`].
pub fn infer(value: &Value) -> ResultSchema {
    match value {
        Value::List(items) => {
            if items.is_empty() {
                return ResultSchema::Opaque;
            }
            let specs: Option<Vec<NumericSpec>> =
                items.iter().map(|v| v.numeric().map(|(spec, _)| spec)).collect();
            match specs {
                Some(specs) => ResultSchema::Composite(specs),
                None => ResultSchema::Opaque,
            }
        }
        other => match other.numeric() {
            Some((spec, _)) => ResultSchema::Numeric(spec),
            None => ResultSchema::Opaque,
        },
    }
}
