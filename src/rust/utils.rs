use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ndarray::{Array1, ArrayView1};

pub(crate) fn normalize_vector(vec: &Array1<f32>) -> Array1<f32> {
    let norm: f32 = vec.iter().map(|&x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        vec / norm
    } else {
        Array1::zeros(vec.len())
    }
}

/// Numerically stable softmax. A degenerate input yields a uniform distribution.
pub(crate) fn softmax(logits: ArrayView1<'_, f32>) -> Array1<f32> {
    if logits.is_empty() {
        return Array1::zeros(0);
    }
    let max = logits.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp = logits.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    if !sum.is_finite() || sum == 0.0 {
        return Array1::from_elem(logits.len(), 1.0 / logits.len() as f32);
    }
    exp / sum
}

pub(crate) fn argmax(values: ArrayView1<'_, f32>) -> usize {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = idx;
        }
    }
    best
}

// Lock helpers: a panic in one holder must not take the whole session down.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
