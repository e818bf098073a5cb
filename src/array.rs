//! Axis-tagged array metadata, in-memory blocks and the source trait

use crate::error::{IngestError, Result};
use crate::types::{AxisKey, AxisTags, DataType, Element, Roi, ValueRange};
use async_trait::async_trait;
use ndarray::{ArrayD, ArrayViewD, IxDyn, ShapeBuilder, Slice};
use std::sync::Arc;

/// Shape, element type and axis tags of an array-like value
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayMeta {
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub axistags: AxisTags,
    /// Optional value range hint, persisted as `drange`
    pub drange: Option<ValueRange>,
}

impl ArrayMeta {
    pub fn new(shape: Vec<usize>, dtype: DataType, axistags: AxisTags) -> Result<Self> {
        if shape.len() != axistags.len() {
            return Err(IngestError::InvalidDimensions(format!(
                "Shape {:?} has {} axes but axis tags '{}' have {}",
                shape,
                shape.len(),
                axistags.keys(),
                axistags.len()
            )));
        }
        Ok(Self {
            shape,
            dtype,
            axistags,
            drange: None,
        })
    }

    pub fn with_drange(mut self, drange: ValueRange) -> Self {
        self.drange = Some(drange);
        self
    }

    /// Extent along the axis with the given key
    pub fn extent_of(&self, key: AxisKey) -> Option<usize> {
        self.axistags.index_of(key).map(|i| self.shape[i])
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.num_elements() * self.dtype.size_in_bytes()
    }

    /// Fail unless `roi` lies inside this array
    pub fn check_roi(&self, roi: &Roi) -> Result<()> {
        if roi.is_within(&self.shape) {
            Ok(())
        } else {
            Err(IngestError::OutOfBounds(format!(
                "ROI {} outside array of shape {:?}",
                roi, self.shape
            )))
        }
    }
}

/// An N-D block of elements of a single data type.
///
/// Held as raw bytes: the trailing axis of the inner array is the
/// little-endian encoding of one element, so blocks of every data type
/// share one representation and strided views stay expressible.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayBlock {
    dtype: DataType,
    data: ArrayD<u8>,
}

fn with_item_axis(shape: &[usize], dtype: DataType) -> Vec<usize> {
    let mut dims = shape.to_vec();
    dims.push(dtype.size_in_bytes());
    dims
}

impl ArrayBlock {
    pub fn zeros(dtype: DataType, shape: &[usize]) -> Self {
        Self {
            dtype,
            data: ArrayD::zeros(IxDyn(&with_item_axis(shape, dtype))),
        }
    }

    /// Zero block laid out in column-major (Fortran) order
    pub fn zeros_fortran(dtype: DataType, shape: &[usize]) -> Self {
        Self {
            dtype,
            data: ArrayD::zeros(IxDyn(&with_item_axis(shape, dtype)).f()),
        }
    }

    /// Wrap C-ordered little-endian bytes
    pub fn from_bytes(dtype: DataType, shape: &[usize], bytes: Vec<u8>) -> Result<Self> {
        let data = ArrayD::from_shape_vec(IxDyn(&with_item_axis(shape, dtype)), bytes)?;
        Ok(Self { dtype, data })
    }

    /// Build from C-ordered typed elements
    pub fn from_elements<T: Element>(shape: &[usize], elements: &[T]) -> Result<Self> {
        let mut bytes = Vec::with_capacity(elements.len() * T::DATA_TYPE.size_in_bytes());
        for e in elements {
            e.extend_le_bytes(&mut bytes);
        }
        Self::from_bytes(T::DATA_TYPE, shape, bytes)
    }

    /// Wrap a byte array whose trailing axis holds element bytes
    pub fn from_raw(dtype: DataType, data: ArrayD<u8>) -> Result<Self> {
        if data.shape().last() != Some(&dtype.size_in_bytes()) {
            return Err(IngestError::InvalidDimensions(format!(
                "Trailing axis of {:?} does not match {} element size",
                data.shape(),
                dtype
            )));
        }
        Ok(Self { dtype, data })
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Element shape, without the trailing byte axis
    pub fn shape(&self) -> &[usize] {
        let dims = self.data.shape();
        &dims[..dims.len() - 1]
    }

    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn raw(&self) -> &ArrayD<u8> {
        &self.data
    }

    pub fn raw_mut(&mut self) -> &mut ArrayD<u8> {
        &mut self.data
    }

    pub fn view(&self) -> ArrayViewD<'_, u8> {
        self.data.view()
    }

    /// Whether the block is laid out in C order without gaps
    pub fn is_contiguous(&self) -> bool {
        self.data.is_standard_layout()
    }

    /// Borrow the bytes if the block is contiguous
    pub fn as_contiguous_bytes(&self) -> Option<&[u8]> {
        if self.is_contiguous() {
            self.data.as_slice()
        } else {
            None
        }
    }

    /// C-ordered bytes, copying only if the block is strided
    pub fn to_contiguous_bytes(&self) -> Vec<u8> {
        match self.as_contiguous_bytes() {
            Some(bytes) => bytes.to_vec(),
            None => self.data.iter().copied().collect(),
        }
    }

    /// Decode into C-ordered typed elements
    pub fn to_elements<T: Element>(&self) -> Result<Vec<T>> {
        if T::DATA_TYPE != self.dtype {
            return Err(IngestError::InvalidDimensions(format!(
                "Block holds {} elements, requested {}",
                self.dtype,
                T::DATA_TYPE
            )));
        }
        let item = self.dtype.size_in_bytes();
        Ok(self
            .to_contiguous_bytes()
            .chunks_exact(item)
            .map(T::from_le_slice)
            .collect())
    }

    /// Copy out the sub-block covering `roi` (relative to this block)
    pub fn region(&self, roi: &Roi) -> Result<ArrayBlock> {
        if !roi.is_within(self.shape()) {
            return Err(IngestError::OutOfBounds(format!(
                "ROI {} outside block of shape {:?}",
                roi,
                self.shape()
            )));
        }
        let view = self.data.slice_each_axis(|ax| {
            let i = ax.axis.index();
            if i < roi.ndim() {
                Slice::from(roi.start[i]..roi.stop[i])
            } else {
                Slice::from(..)
            }
        });
        Ok(ArrayBlock {
            dtype: self.dtype,
            data: view.to_owned(),
        })
    }
}

/// Array-like input that can be read by region.
///
/// Implementations must tolerate concurrent reads.
#[async_trait]
pub trait ArraySource: Send + Sync {
    /// Shape, type and axis tags of the array
    fn meta(&self) -> Result<ArrayMeta>;

    /// Read the region `roi` as a block of shape `roi.extents()`
    async fn read(&self, roi: &Roi) -> Result<ArrayBlock>;
}

/// An [`ArraySource`] over an array already held in memory
#[derive(Debug, Clone)]
pub struct MemorySource {
    meta: ArrayMeta,
    block: Arc<ArrayBlock>,
}

impl MemorySource {
    pub fn new(block: ArrayBlock, axistags: AxisTags) -> Result<Self> {
        let meta = ArrayMeta::new(block.shape().to_vec(), block.dtype(), axistags)?;
        Ok(Self {
            meta,
            block: Arc::new(block),
        })
    }

    pub fn with_drange(mut self, drange: ValueRange) -> Self {
        self.meta = self.meta.with_drange(drange);
        self
    }
}

#[async_trait]
impl ArraySource for MemorySource {
    fn meta(&self) -> Result<ArrayMeta> {
        Ok(self.meta.clone())
    }

    async fn read(&self, roi: &Roi) -> Result<ArrayBlock> {
        self.meta.check_roi(roi)?;
        self.block.region(roi)
    }
}
