//! Owned parameter buffers and ordered parameter collections.
//!
//! A [`Parameter`] owns its bytes exactly as they are stored on disk
//! (little-endian, row-major). Arithmetic is only defined between parameters
//! of the same dtype; nothing is coerced implicitly.

use std::collections::HashMap;

use bytemuck::Pod;
use half::{bf16, f16};
use safetensors::Dtype;

use crate::{MergeError, Result};

/// A named, typed, shaped buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Parameter {
    /// Create a parameter, checking that the buffer matches `shape` and `dtype`.
    pub fn new(name: impl Into<String>, dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let name = name.into();
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(MergeError::ModelLoad(format!(
                "Parameter '{}' has {} bytes, expected {} for {:?} {:?}",
                name,
                data.len(),
                expected,
                dtype,
                shape
            )));
        }
        Ok(Self {
            name,
            dtype,
            shape,
            data,
        })
    }

    /// Create an `F32` parameter from values.
    pub fn from_f32(name: impl Into<String>, shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data = bytemuck::cast_slice(values).to_vec();
        Self::new(name, Dtype::F32, shape, data)
    }

    /// Create a zero-filled parameter.
    pub fn zeros(name: impl Into<String>, dtype: Dtype, shape: Vec<usize>) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size();
        Self {
            name: name.into(),
            dtype,
            shape,
            data: vec![0u8; len],
        }
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element dtype.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Shape, outermost dimension first.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Raw little-endian bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the buffer in bytes.
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// Decode the buffer as `f32` values. Float dtypes only.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let values = match self.dtype {
            Dtype::F32 => bytemuck::pod_collect_to_vec(&self.data),
            Dtype::F64 => decode::<f64>(&self.data).map(|v| v as f32).collect(),
            Dtype::F16 => decode::<f16>(&self.data).map(f16::to_f32).collect(),
            Dtype::BF16 => decode::<bf16>(&self.data).map(bf16::to_f32).collect(),
            dtype => {
                return Err(MergeError::UnsupportedDtype {
                    name: self.name.clone(),
                    dtype,
                })
            }
        };
        Ok(values)
    }

    /// Grow the leading dimension to `rows`, keeping every existing row and
    /// zero-filling the new ones.
    pub(crate) fn grow_rows(self, rows: usize) -> Self {
        let mut shape = self.shape;
        shape[0] = rows;
        let mut data = self.data;
        let len = shape.iter().product::<usize>() * self.dtype.size();
        data.resize(len, 0);
        Self {
            name: self.name,
            dtype: self.dtype,
            shape,
            data,
        }
    }

    /// Elementwise `self += other`.
    ///
    /// Shapes must already agree; the caller reconciles them first.
    pub(crate) fn add_assign(&mut self, other: &Parameter) -> Result<()> {
        if self.dtype != other.dtype {
            return Err(MergeError::DtypeMismatch {
                name: self.name.clone(),
                base: self.dtype,
                delta: other.dtype,
            });
        }
        if self.shape != other.shape {
            return Err(MergeError::ShapeMismatch {
                name: self.name.clone(),
                base: self.shape.clone(),
                delta: other.shape.clone(),
            });
        }

        let (dst, src) = (&mut self.data, &other.data);
        match self.dtype {
            Dtype::F32 => add_elements::<f32>(dst, src, |a, b| a + b),
            Dtype::F64 => add_elements::<f64>(dst, src, |a, b| a + b),
            // Half types accumulate in f32 and round once.
            Dtype::F16 => add_elements::<f16>(dst, src, |a, b| f16::from_f32(a.to_f32() + b.to_f32())),
            Dtype::BF16 => add_elements::<bf16>(dst, src, |a, b| bf16::from_f32(a.to_f32() + b.to_f32())),
            Dtype::I8 => add_elements::<i8>(dst, src, i8::wrapping_add),
            Dtype::I16 => add_elements::<i16>(dst, src, i16::wrapping_add),
            Dtype::I32 => add_elements::<i32>(dst, src, i32::wrapping_add),
            Dtype::I64 => add_elements::<i64>(dst, src, i64::wrapping_add),
            Dtype::U8 => add_elements::<u8>(dst, src, u8::wrapping_add),
            Dtype::U16 => add_elements::<u16>(dst, src, u16::wrapping_add),
            Dtype::U32 => add_elements::<u32>(dst, src, u32::wrapping_add),
            Dtype::U64 => add_elements::<u64>(dst, src, u64::wrapping_add),
            dtype => {
                return Err(MergeError::UnsupportedDtype {
                    name: self.name.clone(),
                    dtype,
                })
            }
        }
        Ok(())
    }
}

/// Iterate the elements of a possibly unaligned buffer.
fn decode<T: Pod>(data: &[u8]) -> impl Iterator<Item = T> + '_ {
    data.chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
}

/// `dst[i] = add(dst[i], src[i])` over raw element bytes.
fn add_elements<T: Pod>(dst: &mut [u8], src: &[u8], add: impl Fn(T, T) -> T) {
    let size = std::mem::size_of::<T>();
    for (d, s) in dst.chunks_exact_mut(size).zip(src.chunks_exact(size)) {
        let sum = add(bytemuck::pod_read_unaligned(d), bytemuck::pod_read_unaligned(s));
        d.copy_from_slice(bytemuck::bytes_of(&sum));
    }
}

/// An insertion-ordered collection of uniquely named parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterMap {
    params: Vec<Parameter>,
    index: HashMap<String, usize>,
    bytes: usize,
}

impl ParameterMap {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter. Names must be unique.
    pub fn insert(&mut self, param: Parameter) -> Result<()> {
        if self.index.contains_key(param.name()) {
            return Err(MergeError::ModelLoad(format!(
                "Duplicate parameter '{}'",
                param.name()
            )));
        }
        self.bytes += param.byte_size();
        self.index.insert(param.name.clone(), self.params.len());
        self.params.push(param);
        Ok(())
    }

    /// Look up a parameter by name.
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&i| &self.params[i])
    }

    /// Whether a parameter with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total buffer size in bytes.
    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    /// Parameter names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name())
    }

    /// Parameters in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.params.iter()
    }
}

impl IntoIterator for ParameterMap {
    type Item = Parameter;
    type IntoIter = std::vec::IntoIter<Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.into_iter()
    }
}

impl<'a> IntoIterator for &'a ParameterMap {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_length() {
        let err = Parameter::new("w", Dtype::F32, vec![2, 2], vec![0u8; 12]).unwrap_err();
        assert!(err.to_string().contains("expected 16"));
        assert!(Parameter::new("w", Dtype::F32, vec![2, 2], vec![0u8; 16]).is_ok());
    }

    #[test]
    fn test_add_assign_f32() {
        let mut a = Parameter::from_f32("w", vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let b = Parameter::from_f32("w", vec![3], &[0.5, -2.0, 10.0]).unwrap();
        a.add_assign(&b).unwrap();
        assert_eq!(a.to_f32_vec().unwrap(), vec![1.5, 0.0, 13.0]);
    }

    #[test]
    fn test_add_assign_half_types() {
        let halves = |dtype: Dtype, values: &[f32]| {
            let data: Vec<u8> = match dtype {
                Dtype::F16 => bytemuck::cast_slice(&values.iter().map(|v| f16::from_f32(*v)).collect::<Vec<_>>()).to_vec(),
                _ => bytemuck::cast_slice(&values.iter().map(|v| bf16::from_f32(*v)).collect::<Vec<_>>()).to_vec(),
            };
            Parameter::new("h", dtype, vec![values.len()], data).unwrap()
        };

        for dtype in [Dtype::F16, Dtype::BF16] {
            let mut a = halves(dtype, &[1.0, 2.0]);
            let b = halves(dtype, &[0.5, 4.0]);
            a.add_assign(&b).unwrap();
            assert_eq!(a.dtype(), dtype);
            assert_eq!(a.to_f32_vec().unwrap(), vec![1.5, 6.0]);
        }
    }

    #[test]
    fn test_add_assign_rejects_dtype_mismatch() {
        let mut a = Parameter::from_f32("w", vec![1], &[1.0]).unwrap();
        let b = Parameter::new("w", Dtype::F16, vec![2], vec![0u8; 4]).unwrap();
        let err = a.add_assign(&b).unwrap_err();
        assert!(matches!(err, MergeError::DtypeMismatch { .. }));
    }

    #[test]
    fn test_add_assign_integer_dtypes() {
        let mut ids = Parameter::new(
            "position_ids",
            Dtype::I64,
            vec![3],
            bytemuck::cast_slice(&[0i64, 1, -5]).to_vec(),
        )
        .unwrap();
        let delta = Parameter::new("position_ids", Dtype::I64, vec![3], bytemuck::cast_slice(&[2i64, 0, 5]).to_vec())
            .unwrap();
        ids.add_assign(&delta).unwrap();
        assert_eq!(bytemuck::pod_collect_to_vec::<u8, i64>(ids.data()), vec![2, 1, 0]);

        // Overflow wraps instead of failing the merge.
        let mut a = Parameter::new("mask", Dtype::U8, vec![2], vec![250, 1]).unwrap();
        let b = Parameter::new("mask", Dtype::U8, vec![2], vec![10, 1]).unwrap();
        a.add_assign(&b).unwrap();
        assert_eq!(a.data(), &[4, 2]);

        let mut a = Parameter::new("i32", Dtype::I32, vec![1], bytemuck::bytes_of(&i32::MAX).to_vec()).unwrap();
        let b = Parameter::new("i32", Dtype::I32, vec![1], bytemuck::bytes_of(&1i32).to_vec()).unwrap();
        a.add_assign(&b).unwrap();
        assert_eq!(bytemuck::pod_read_unaligned::<i32>(a.data()), i32::MIN);
    }

    #[test]
    fn test_add_assign_rejects_bool() {
        let mut a = Parameter::new("flags", Dtype::BOOL, vec![2], vec![0, 1]).unwrap();
        let b = a.clone();
        let err = a.add_assign(&b).unwrap_err();
        assert!(matches!(err, MergeError::UnsupportedDtype { dtype: Dtype::BOOL, .. }));
    }

    #[test]
    fn test_decode_unaligned_buffer() {
        // Slice off one byte so the f32 payload is not 4-byte aligned.
        let mut raw = vec![0u8];
        raw.extend_from_slice(bytemuck::cast_slice(&[1.5f32, -2.0]));
        let values: Vec<f32> = decode(&raw[1..]).collect();
        assert_eq!(values, vec![1.5, -2.0]);

        let mut dst = raw[1..].to_vec();
        add_elements::<f32>(&mut dst, &raw[1..], |a, b| a + b);
        assert_eq!(decode::<f32>(&dst).collect::<Vec<_>>(), vec![3.0, -4.0]);
    }

    #[test]
    fn test_grow_rows_keeps_existing_rows() {
        let p = Parameter::from_f32("embed", vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let grown = p.grow_rows(3);
        assert_eq!(grown.shape(), &[3, 2]);
        assert_eq!(grown.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0]);
    }

    #[test]
    fn test_parameter_map_order_and_uniqueness() {
        let mut map = ParameterMap::new();
        map.insert(Parameter::from_f32("b", vec![1], &[1.0]).unwrap()).unwrap();
        map.insert(Parameter::from_f32("a", vec![2], &[1.0, 2.0]).unwrap()).unwrap();
        assert_eq!(map.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(map.byte_size(), 12);
        assert!(map.contains("a"));

        let dup = map.insert(Parameter::from_f32("a", vec![1], &[0.0]).unwrap());
        assert!(dup.is_err());
        assert_eq!(map.len(), 2);
    }
}
