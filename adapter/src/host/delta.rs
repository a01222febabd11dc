use std::{collections::HashMap, sync::Arc};

use log::trace;
use parking_lot::{Mutex, RwLock};

use super::SharedTensor;
use crate::{AdapterErr, Result, spec::WeightMap};

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

/// Derives the identity of a weight's gradient entry from its layer and name.
///
/// The value only depends on the two strings, so it is stable across runs and processes.
pub fn stable_id(layer: &str, weight: &str) -> u64 {
    let mut hash = FNV1A_OFFSET;

    for byte in layer.bytes().chain([0]).chain(weight.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }

    hash
}

/// An in-place gradient accumulator bound to one weight's storage.
#[derive(Debug)]
pub struct DeltaEntry {
    id: u64,
    target: SharedTensor,
    delta: Mutex<Vec<f64>>,
}

impl DeltaEntry {
    fn new(id: u64, target: &SharedTensor) -> Self {
        let len = target.read().len();

        Self {
            id,
            target: Arc::clone(target),
            delta: Mutex::new(vec![0.; len]),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Adds `grad` elementwise into the accumulated delta.
    ///
    /// # Returns
    /// A `SizeMismatch` if `grad` isn't as long as the bound weight.
    pub fn add_in_place(&self, grad: &[f64]) -> Result<()> {
        let mut delta = self.delta.lock();

        if delta.len() != grad.len() {
            return Err(AdapterErr::SizeMismatch {
                what: "weight gradient",
                got: grad.len(),
                expected: delta.len(),
            });
        }

        delta.iter_mut().zip(grad).for_each(|(acc, g)| *acc += g);
        Ok(())
    }

    /// Returns a copy of the accumulated delta.
    pub fn delta(&self) -> Vec<f64> {
        self.delta.lock().clone()
    }

    /// Adds `factor` times the accumulated delta into the bound weight.
    pub fn apply(&self, factor: f64) {
        let delta = self.delta.lock();
        let mut target = self.target.write();

        target
            .data_mut()
            .iter_mut()
            .zip(delta.iter())
            .for_each(|(w, d)| *w += factor * d);
    }
}

/// The gradient accumulation set of one training step, keyed by stable weight identity.
#[derive(Debug, Default)]
pub struct DeltaSet {
    entries: RwLock<HashMap<u64, Arc<DeltaEntry>>>,
}

impl DeltaSet {
    /// Creates a new, empty `DeltaSet`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry with identity `id`, creating it bound to `target` if absent.
    pub fn get(&self, id: u64, target: &SharedTensor) -> Arc<DeltaEntry> {
        if let Some(entry) = self.entries.read().get(&id) {
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write();
        let entry = entries
            .entry(id)
            .or_insert_with(|| Arc::new(DeltaEntry::new(id, target)));

        Arc::clone(entry)
    }

    /// Returns the entry with identity `id`, if it was touched this step.
    pub fn entry(&self, id: u64) -> Option<Arc<DeltaEntry>> {
        self.entries.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops every entry, ending the step.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Routes a layer's weight gradients into a `DeltaSet`.
#[derive(Debug, Clone)]
pub struct DeltaAccumulator {
    layer: String,
    weights: WeightMap,
}

impl DeltaAccumulator {
    /// Creates a new `DeltaAccumulator`.
    ///
    /// # Arguments
    /// * `layer` - The identity of the layer owning `weights`.
    /// * `weights` - The weights, keyed by the same names the graph uses for them.
    ///
    /// # Returns
    /// A new `DeltaAccumulator` instance.
    pub fn new(layer: impl Into<String>, weights: WeightMap) -> Self {
        Self {
            layer: layer.into(),
            weights,
        }
    }

    /// Returns the entry of `weight` in `deltas`, creating it if absent.
    pub fn get(&self, deltas: &DeltaSet, weight: &str) -> Result<Arc<DeltaEntry>> {
        let target = self
            .weights
            .get(weight)
            .ok_or_else(|| AdapterErr::GradientWiring {
                node: weight.to_string(),
                cause: engine::EngineErr::NodeNotFound(weight.to_string()),
            })?;

        Ok(deltas.get(stable_id(&self.layer, weight), target))
    }

    /// Adds `grad` into the entry of `weight`.
    pub fn accumulate(&self, deltas: &DeltaSet, weight: &str, grad: &[f64]) -> Result<()> {
        trace!(layer = self.layer.as_str(), weight = weight; "accumulating weight gradient");
        self.get(deltas, weight)?.add_in_place(grad)
    }
}
