//! Recursive device/dtype moves over nested tensor containers.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Result, Tensor};

/// A tree of tensors shaped like a checkpoint or a batch of model inputs.
///
/// Lists and tuples are kept apart so a round trip preserves which one the
/// caller built. Leaves that are not tensors ride along untouched.
#[derive(Debug, Clone)]
pub enum NestedTensors {
    Tensor(Tensor),
    List(Vec<NestedTensors>),
    Tuple(Vec<NestedTensors>),
    Dict(BTreeMap<String, NestedTensors>),
    Other(serde_json::Value),
}

impl NestedTensors {
    /// Returns the tensor for a leaf, `None` for containers and other values.
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            NestedTensors::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    /// Visits every tensor leaf depth-first.
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        match self {
            NestedTensors::Tensor(tensor) => out.push(tensor),
            NestedTensors::List(items) | NestedTensors::Tuple(items) => {
                items.iter().for_each(|item| item.collect(out))
            }
            NestedTensors::Dict(entries) => entries.values().for_each(|item| item.collect(out)),
            NestedTensors::Other(_) => {}
        }
    }
}

impl From<Tensor> for NestedTensors {
    fn from(tensor: Tensor) -> Self {
        NestedTensors::Tensor(tensor)
    }
}

/// Moves every tensor in `input` to `device` and casts it to `dtype`.
///
/// `None` keeps each tensor's own device or dtype. Container kinds, ordering
/// and dictionary keys are preserved.
pub fn to_device_dtype(
    input: &NestedTensors,
    device: Option<&Device>,
    dtype: Option<DType>,
) -> Result<NestedTensors> {
    Ok(match input {
        NestedTensors::Tensor(tensor) => {
            let moved = match device {
                Some(device) => tensor.to_device(device)?,
                None => tensor.clone(),
            };
            let cast = match dtype {
                Some(dtype) if dtype != moved.dtype() => moved.to_dtype(dtype)?,
                _ => moved,
            };
            NestedTensors::Tensor(cast)
        }
        NestedTensors::List(items) => NestedTensors::List(
            items
                .iter()
                .map(|item| to_device_dtype(item, device, dtype))
                .collect::<Result<_>>()?,
        ),
        NestedTensors::Tuple(items) => NestedTensors::Tuple(
            items
                .iter()
                .map(|item| to_device_dtype(item, device, dtype))
                .collect::<Result<_>>()?,
        ),
        NestedTensors::Dict(entries) => NestedTensors::Dict(
            entries
                .iter()
                .map(|(key, item)| Ok((key.clone(), to_device_dtype(item, device, dtype)?)))
                .collect::<Result<_>>()?,
        ),
        NestedTensors::Other(value) => NestedTensors::Other(value.clone()),
    })
}
