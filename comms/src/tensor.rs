//! Transport-safe representation of typed multi-dimensional arrays.
//!
//! A tensor travels as `{"dtype": "...", "shape": [...], "data_b64": "..."}`, the
//! payload being the raw row-major element bytes (little-endian) in standard
//! base64 with padding.

use std::{error::Error, fmt, str::FromStr};

use base64::{Engine, engine::general_purpose::STANDARD};
use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The element types a tensor may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float16,
    Bfloat16,
    Float32,
    Float64,
}

impl DType {
    pub const ALL: [DType; 12] = [
        DType::Uint8,
        DType::Int8,
        DType::Uint16,
        DType::Int16,
        DType::Uint32,
        DType::Int32,
        DType::Uint64,
        DType::Int64,
        DType::Float16,
        DType::Bfloat16,
        DType::Float32,
        DType::Float64,
    ];

    /// The canonical wire name.
    pub fn name(self) -> &'static str {
        match self {
            DType::Uint8 => "uint8",
            DType::Int8 => "int8",
            DType::Uint16 => "uint16",
            DType::Int16 => "int16",
            DType::Uint32 => "uint32",
            DType::Int32 => "int32",
            DType::Uint64 => "uint64",
            DType::Int64 => "int64",
            DType::Float16 => "float16",
            DType::Bfloat16 => "bfloat16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    /// Size in bytes of a single element.
    pub fn size(self) -> usize {
        match self {
            DType::Uint8 | DType::Int8 => 1,
            DType::Uint16 | DType::Int16 | DType::Float16 | DType::Bfloat16 => 2,
            DType::Uint32 | DType::Int32 | DType::Float32 => 4,
            DType::Uint64 | DType::Int64 | DType::Float64 => 8,
        }
    }
}

impl FromStr for DType {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DType::ALL
            .into_iter()
            .find(|dtype| dtype.name() == s)
            .ok_or_else(|| TensorError::UnknownDType(s.to_string()))
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rust element types that map onto a `DType`.
pub trait Element: bytemuck::Pod {
    const DTYPE: DType;
}

macro_rules! element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: DType = DType::$dtype;
        })*
    };
}

element! {
    u8 => Uint8,
    i8 => Int8,
    u16 => Uint16,
    i16 => Int16,
    u32 => Uint32,
    i32 => Int32,
    u64 => Uint64,
    i64 => Int64,
    f16 => Float16,
    bf16 => Bfloat16,
    f32 => Float32,
    f64 => Float64,
}

/// Codec failures, all of them reported to clients as protocol errors.
#[derive(Debug)]
pub enum TensorError {
    UnknownDType(String),
    ShapeMismatch {
        shape: Vec<usize>,
        dtype: DType,
        bytes: usize,
    },
    InvalidBase64(base64::DecodeError),
    /// The value is not a `{dtype, shape, data_b64}` object.
    Schema(String),
    DTypeMismatch {
        expected: DType,
        got: DType,
    },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::UnknownDType(name) => write!(f, "unknown dtype {name:?}"),
            TensorError::ShapeMismatch {
                shape,
                dtype,
                bytes,
            } => write!(
                f,
                "shape {shape:?} of {dtype} does not match a payload of {bytes} bytes"
            ),
            TensorError::InvalidBase64(e) => write!(f, "invalid base64 payload: {e}"),
            TensorError::Schema(msg) => write!(f, "invalid tensor object: {msg}"),
            TensorError::DTypeMismatch { expected, got } => {
                write!(f, "tensor holds {got}, requested {expected}")
            }
        }
    }
}

impl Error for TensorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TensorError::InvalidBase64(e) => Some(e),
            _ => None,
        }
    }
}

/// The wire form of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorPayload {
    pub dtype: String,
    pub shape: Vec<usize>,
    #[serde(alias = "data")]
    pub data_b64: String,
}

/// A dense row-major array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    /// Creates a tensor over raw element bytes.
    ///
    /// # Errors
    /// `ShapeMismatch` if `data` is not exactly `shape`'s element count times the element size.
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, TensorError> {
        match byte_len(dtype, &shape) {
            Some(len) if len == data.len() => Ok(Self { dtype, shape, data }),
            _ => Err(TensorError::ShapeMismatch {
                shape,
                dtype,
                bytes: data.len(),
            }),
        }
    }

    /// Creates a tensor copying typed `values`.
    pub fn from_slice<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self, TensorError> {
        Self::new(T::DTYPE, shape, bytemuck::cast_slice::<T, u8>(values).to_vec())
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Amount of elements held.
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies the elements out as `T`.
    ///
    /// # Errors
    /// `DTypeMismatch` if `T` is not the element type of this tensor.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, TensorError> {
        if T::DTYPE != self.dtype {
            return Err(TensorError::DTypeMismatch {
                expected: T::DTYPE,
                got: self.dtype,
            });
        }

        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    /// Encodes this tensor into its JSON object form.
    pub fn to_json(&self) -> Value {
        // Only strings and integers, serialization cannot fail.
        serde_json::to_value(encode(self)).unwrap_or(Value::Null)
    }

    /// Decodes a tensor out of its JSON object form.
    pub fn from_json(value: &Value) -> Result<Self, TensorError> {
        let payload = TensorPayload::deserialize(value)
            .map_err(|e| TensorError::Schema(e.to_string()))?;

        decode(&payload)
    }
}

fn byte_len(dtype: DType, shape: &[usize]) -> Option<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))?
        .checked_mul(dtype.size())
}

/// Encodes `tensor` into its transport form.
pub fn encode(tensor: &Tensor) -> TensorPayload {
    TensorPayload {
        dtype: tensor.dtype.name().to_string(),
        shape: tensor.shape.clone(),
        data_b64: STANDARD.encode(&tensor.data),
    }
}

/// Decodes a transport payload back into a tensor.
///
/// # Errors
/// `UnknownDType`, `InvalidBase64` or `ShapeMismatch`.
pub fn decode(payload: &TensorPayload) -> Result<Tensor, TensorError> {
    let dtype = payload.dtype.parse()?;
    let data = STANDARD
        .decode(&payload.data_b64)
        .map_err(TensorError::InvalidBase64)?;

    Tensor::new(dtype, payload.shape.clone(), data)
}

/// Whether `value` looks like an embedded tensor object.
pub fn is_tensor(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };

    obj.get("dtype").is_some_and(Value::is_string)
        && obj.get("shape").is_some_and(Value::is_array)
        && (obj.contains_key("data_b64") || obj.contains_key("data"))
}
