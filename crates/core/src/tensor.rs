//! Candle tensor adapter.
//!
//! The engine's kernels speak flat typed device buffers; the surrounding
//! model code speaks `candle_core::Tensor`. This module bridges the two:
//! host tensors upload to mesh buffers, results download back, and
//! `all_reduce_tensors` runs the whole collective over a slice of
//! same-shaped CPU tensors, one per rank.

use candle_core::{Device, Tensor, WithDType};

use crate::config::CollectiveConfig;
use crate::dispatch::{all_reduce_with_config, Epilogue};
use crate::element::{DType, Element};
use crate::error::{CollectiveError, Result};
use crate::runtime::{DeviceBuffer, DeviceMesh};
use crate::signal::Signal;

/// Map a candle dtype to the engine's storage dtype.
pub fn dtype_from_candle(dtype: candle_core::DType) -> Result<DType> {
    match dtype {
        candle_core::DType::F16 => Ok(DType::F16),
        candle_core::DType::BF16 => Ok(DType::BF16),
        candle_core::DType::F32 => Ok(DType::F32),
        other => Err(CollectiveError::UnsupportedDType(other)),
    }
}

/// Upload a host tensor onto `device`, flattened.
///
/// The tensor's dtype must match `T`'s storage dtype; a mismatched tensor
/// in a rank table is rejected before any upload happens.
pub fn buffer_from_tensor<T: Element + WithDType>(
    mesh: &DeviceMesh,
    device: usize,
    tensor: &Tensor,
) -> Result<DeviceBuffer<T>> {
    let actual = dtype_from_candle(tensor.dtype())?;
    if actual != <T as Element>::DTYPE {
        return Err(CollectiveError::DTypeMismatch {
            rank: device,
            expected: <T as Element>::DTYPE,
            actual,
        });
    }
    let host: Vec<T> = tensor.flatten_all()?.to_vec1()?;
    DeviceBuffer::from_slice(mesh, device, &host)
}

/// Download a buffer into a 1-D CPU tensor.
pub fn tensor_from_buffer<T: Element + WithDType>(buffer: &DeviceBuffer<T>) -> Result<Tensor> {
    let host = buffer.to_vec();
    let len = host.len();
    Ok(Tensor::from_vec(host, len, &Device::Cpu)?)
}

/// All-reduce a slice of same-shaped CPU tensors, one per rank.
///
/// Allocates buffers and signals internally, which is convenient for tests
/// and one-shot calls; hot paths should hold their own rank table and call
/// [`all_reduce_with_config`] directly so signals persist across calls.
/// Returns one flattened result tensor per rank.
pub fn all_reduce_tensors<T: Element + WithDType>(
    mesh: &DeviceMesh,
    tensors: &[Tensor],
    epilogue: Option<&Epilogue>,
    config: &CollectiveConfig,
) -> Result<Vec<Tensor>> {
    let n = tensors.len();
    let inputs: Vec<DeviceBuffer<T>> = tensors
        .iter()
        .enumerate()
        .map(|(rank, t)| buffer_from_tensor(mesh, rank, t))
        .collect::<Result<_>>()?;
    let num_elements = inputs.first().map_or(0, |b| b.len());
    let mut outputs: Vec<DeviceBuffer<T>> = (0..n)
        .map(|rank| DeviceBuffer::zeros(mesh, rank, num_elements))
        .collect::<Result<_>>()?;
    let signals: Vec<Signal> = (0..n)
        .map(|_| {
            Signal::new(Signal::required_scratch_bytes(
                num_elements,
                <T as Element>::DTYPE,
            ))
        })
        .collect();

    all_reduce_with_config(mesh, &inputs, &mut outputs, &signals, epilogue, config)?;
    outputs.iter().map(tensor_from_buffer).collect()
}
