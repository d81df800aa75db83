//! Dense host tensors used as optimizer state values
//!
//! The conversion crates only need a narrow slice of tensor semantics:
//! shape and dtype queries, flattening, reshaping, contiguous slicing,
//! concatenation and zero allocation. Data is stored row-major.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I32 => "int32",
            DType::I64 => "int64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Placement of tensor data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Accelerator(u32),
}

impl Device {
    /// Device type, ignoring the ordinal
    pub fn kind(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Accelerator(_) => "accelerator",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator(ordinal) => write!(f, "accelerator:{}", ordinal),
        }
    }
}

/// Typed element buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Storage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

macro_rules! map_storage {
    ($storage:expr, $v:ident => $body:expr) => {
        match $storage {
            Storage::F32($v) => Storage::F32($body),
            Storage::F64($v) => Storage::F64($body),
            Storage::I32($v) => Storage::I32($body),
            Storage::I64($v) => Storage::I64($body),
        }
    };
}

macro_rules! with_storage {
    ($storage:expr, $v:ident => $body:expr) => {
        match $storage {
            Storage::F32($v) => $body,
            Storage::F64($v) => $body,
            Storage::I32($v) => $body,
            Storage::I64($v) => $body,
        }
    };
}

impl Storage {
    fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Storage::F32(vec![0.0; len]),
            DType::F64 => Storage::F64(vec![0.0; len]),
            DType::I32 => Storage::I32(vec![0; len]),
            DType::I64 => Storage::I64(vec![0; len]),
        }
    }

    fn len(&self) -> usize {
        with_storage!(self, v => v.len())
    }

    fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
            Storage::I32(_) => DType::I32,
            Storage::I64(_) => DType::I64,
        }
    }

    fn slice(&self, start: usize, end: usize) -> Self {
        map_storage!(self, v => v[start..end].to_vec())
    }

    fn extend_from(&mut self, other: &Storage) -> Result<()> {
        match (self, other) {
            (Storage::F32(a), Storage::F32(b)) => a.extend_from_slice(b),
            (Storage::F64(a), Storage::F64(b)) => a.extend_from_slice(b),
            (Storage::I32(a), Storage::I32(b)) => a.extend_from_slice(b),
            (Storage::I64(a), Storage::I64(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(Error::tensor(format!(
                    "cannot concatenate {} with {}",
                    a.dtype(),
                    b.dtype()
                )))
            }
        }
        Ok(())
    }

    fn value_at(&self, index: usize) -> f64 {
        match self {
            Storage::F32(v) => v[index] as f64,
            Storage::F64(v) => v[index],
            Storage::I32(v) => v[index] as f64,
            Storage::I64(v) => v[index] as f64,
        }
    }
}

/// Scalar types that can back a tensor
pub trait Element: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;

    fn into_storage(data: Vec<Self>) -> Storage;

    fn from_storage(storage: &Storage) -> Option<&[Self]>;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;

            fn into_storage(data: Vec<Self>) -> Storage {
                Storage::$variant(data)
            }

            fn from_storage(storage: &Storage) -> Option<&[Self]> {
                match storage {
                    Storage::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(f32, F32);
impl_element!(f64, F64);
impl_element!(i32, I32);
impl_element!(i64, I64);

/// Dense row-major tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    storage: Storage,
    device: Device,
}

fn numel_of(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl Tensor {
    /// Build a CPU tensor from row-major data
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let expected = numel_of(shape);
        if data.len() != expected {
            return Err(Error::tensor(format!(
                "shape {:?} needs {} elements but got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            storage: T::into_storage(data),
            device: Device::Cpu,
        })
    }

    /// Build a one-dimensional CPU tensor
    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        Self {
            shape: vec![data.len()],
            storage: T::into_storage(data.to_vec()),
            device: Device::Cpu,
        }
    }

    /// Build a zero-dimension CPU tensor
    pub fn scalar<T: Element>(value: T) -> Self {
        Self {
            shape: Vec::new(),
            storage: T::into_storage(vec![value]),
            device: Device::Cpu,
        }
    }

    pub fn zeros(shape: &[usize], dtype: DType, device: Device) -> Self {
        Self {
            shape: shape.to_vec(),
            storage: Storage::zeros(dtype, numel_of(shape)),
            device,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.storage.len()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_zero_dim(&self) -> bool {
        self.shape.is_empty()
    }

    /// Copy of this tensor placed on `device`
    pub fn to(&self, device: Device) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            storage: self.storage.clone(),
            device,
        }
    }

    pub fn cpu(&self) -> Tensor {
        self.to(Device::Cpu)
    }

    pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
        T::from_storage(&self.storage).map(|s| s.to_vec())
    }

    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::from_storage(&self.storage)
    }

    /// One-dimensional view of all elements
    pub fn flatten(&self) -> Tensor {
        Tensor {
            shape: vec![self.numel()],
            storage: self.storage.clone(),
            device: self.device,
        }
    }

    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        if numel_of(shape) != self.numel() {
            return Err(Error::tensor(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, shape
            )));
        }
        Ok(Tensor {
            shape: shape.to_vec(),
            storage: self.storage.clone(),
            device: self.device,
        })
    }

    /// Contiguous one-dimensional slice `[start, start + len)` of the flattened data
    pub fn narrow(&self, start: usize, len: usize) -> Result<Tensor> {
        let end = start + len;
        if end > self.numel() {
            return Err(Error::tensor(format!(
                "slice [{}, {}) out of bounds for {} elements",
                start,
                end,
                self.numel()
            )));
        }
        Ok(Tensor {
            shape: vec![len],
            storage: self.storage.slice(start, end),
            device: self.device,
        })
    }

    /// Rows `[start, start + len)` along the first dimension
    pub fn rows(&self, start: usize, len: usize) -> Result<Tensor> {
        let Some(&dim0) = self.shape.first() else {
            return Err(Error::tensor("cannot take rows of a zero-dimension tensor"));
        };
        if start + len > dim0 {
            return Err(Error::tensor(format!(
                "rows [{}, {}) out of bounds for first dimension {}",
                start,
                start + len,
                dim0
            )));
        }
        let row_numel = numel_of(&self.shape[1..]);
        let mut shape = self.shape.clone();
        shape[0] = len;
        Ok(Tensor {
            shape,
            storage: self.storage.slice(start * row_numel, (start + len) * row_numel),
            device: self.device,
        })
    }

    /// Concatenate the flattened data of `tensors` into one 1-D tensor
    pub fn cat(tensors: &[Tensor]) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::tensor("cannot concatenate an empty tensor list"))?;
        let mut storage = Storage::zeros(first.dtype(), 0);
        for tensor in tensors {
            storage.extend_from(&tensor.storage)?;
        }
        Ok(Tensor {
            shape: vec![storage.len()],
            storage,
            device: first.device,
        })
    }

    /// Concatenate along the first dimension; trailing dimensions must agree
    pub fn cat_rows(tensors: &[Tensor]) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::tensor("cannot concatenate an empty tensor list"))?;
        if first.dim() == 0 {
            return Err(Error::tensor("cannot concatenate zero-dimension tensors"));
        }
        let mut rows = 0;
        for tensor in tensors {
            if tensor.dim() != first.dim() || tensor.shape[1..] != first.shape[1..] {
                return Err(Error::tensor(format!(
                    "row shapes differ: {:?} vs {:?}",
                    tensor.shape, first.shape
                )));
            }
            rows += tensor.shape[0];
        }
        let flat = Tensor::cat(tensors)?;
        let mut shape = first.shape.clone();
        shape[0] = rows;
        flat.reshape(&shape)
    }

    /// Append `count` zeros to the flattened data
    pub fn pad(&self, count: usize) -> Result<Tensor> {
        if count == 0 {
            return Ok(self.flatten());
        }
        let zeros = Tensor::zeros(&[count], self.dtype(), self.device);
        Tensor::cat(&[self.flatten(), zeros])
    }

    /// Overwrite flattened elements `[offset, offset + src.numel())` with `src`
    pub fn write_at(&mut self, offset: usize, src: &Tensor) -> Result<()> {
        let end = offset + src.numel();
        if end > self.numel() {
            return Err(Error::tensor(format!(
                "write [{}, {}) out of bounds for {} elements",
                offset,
                end,
                self.numel()
            )));
        }
        match (&mut self.storage, &src.storage) {
            (Storage::F32(a), Storage::F32(b)) => a[offset..end].copy_from_slice(b),
            (Storage::F64(a), Storage::F64(b)) => a[offset..end].copy_from_slice(b),
            (Storage::I32(a), Storage::I32(b)) => a[offset..end].copy_from_slice(b),
            (Storage::I64(a), Storage::I64(b)) => a[offset..end].copy_from_slice(b),
            (a, b) => {
                return Err(Error::tensor(format!(
                    "cannot write {} into {}",
                    b.dtype(),
                    a.dtype()
                )))
            }
        }
        Ok(())
    }

    /// Value of a single-element tensor
    pub fn item(&self) -> Result<f64> {
        if self.numel() != 1 {
            return Err(Error::tensor(format!(
                "item() needs exactly one element, tensor has {}",
                self.numel()
            )));
        }
        Ok(self.storage.value_at(0))
    }

    /// Overwrite this tensor's data with `src`, keeping shape and device
    pub fn copy_from(&mut self, src: &Tensor) -> Result<()> {
        if src.numel() != self.numel() || src.dtype() != self.dtype() {
            return Err(Error::tensor(format!(
                "cannot copy {} {} elements into {} {} elements",
                src.numel(),
                src.dtype(),
                self.numel(),
                self.dtype()
            )));
        }
        self.storage = src.storage.clone();
        Ok(())
    }

    /// Shape and element equality, ignoring placement
    pub fn values_equal(&self, other: &Tensor) -> bool {
        self.shape == other.shape && self.storage == other.storage
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero_dim() {
            write!(f, "tensor({}, dtype={})", self.storage.value_at(0), self.dtype())
        } else {
            write!(f, "Tensor(shape={:?}, dtype={})", self.shape, self.dtype())
        }
    }
}
