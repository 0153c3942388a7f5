// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Combine functions for tree reductions.
//!
//! A [`Reducer`] must be associative and commutative: children report in any
//! order and the engine folds them as they arrive.

use std::collections::{BTreeSet, HashSet};
use std::hash::{BuildHasher, Hash};
use std::ops::Add;

pub trait Reducer<T>: Send + Sync + 'static {
    fn combine(&self, acc: T, other: T) -> T;
}

/// Addition.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl<T: Add<Output = T>> Reducer<T> for Sum {
    fn combine(&self, acc: T, other: T) -> T {
        acc + other
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl<T: Ord> Reducer<T> for Min {
    fn combine(&self, acc: T, other: T) -> T {
        acc.min(other)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

impl<T: Ord> Reducer<T> for Max {
    fn combine(&self, acc: T, other: T) -> T {
        acc.max(other)
    }
}

/// Set union.
#[derive(Debug, Clone, Copy, Default)]
pub struct Union;

impl<V: Ord> Reducer<BTreeSet<V>> for Union {
    fn combine(&self, mut acc: BTreeSet<V>, mut other: BTreeSet<V>) -> BTreeSet<V> {
        acc.append(&mut other);
        acc
    }
}

impl<V, S> Reducer<HashSet<V, S>> for Union
where
    V: Eq + Hash,
    S: BuildHasher,
{
    fn combine(&self, mut acc: HashSet<V, S>, other: HashSet<V, S>) -> HashSet<V, S> {
        acc.extend(other);
        acc
    }
}

/// Caller-supplied closure. The closure must itself be associative and
/// commutative.
pub struct FnReducer<F>(pub F);

impl<T, F> Reducer<T> for FnReducer<F>
where
    F: Fn(T, T) -> T + Send + Sync + 'static,
{
    fn combine(&self, acc: T, other: T) -> T {
        (self.0)(acc, other)
    }
}
