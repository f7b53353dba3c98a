// Copyright (c) 2017-2019 Fabian Schuiki

//! Deoptimization environments.

use crate::ir::Inst;
use imbl::Vector;
use std::fmt;

/// A snapshot of the local variables and expression stack of the unoptimized
/// code at a deoptimization point.
///
/// The values are kept in a persistent vector. Cloning an environment shares
/// structure with the original, and updating one copy never affects another.
#[derive(Clone, PartialEq)]
pub struct Environment {
    values: Vector<Inst>,
    fixed_parameter_count: usize,
}

impl Environment {
    /// Create an environment from a list of definitions.
    pub fn new(values: Vector<Inst>, fixed_parameter_count: usize) -> Self {
        Self {
            values,
            fixed_parameter_count,
        }
    }

    /// The number of values in the environment.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check whether the environment holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The number of fixed parameters of the method, which come first.
    pub fn fixed_parameter_count(&self) -> usize {
        self.fixed_parameter_count
    }

    /// Get the value at an index.
    pub fn value_at(&self, index: usize) -> Inst {
        self.values[index]
    }

    /// Replace the value at an index.
    pub fn set_value_at(&mut self, index: usize, value: Inst) {
        self.values.set(index, value);
    }

    /// Iterate over the values.
    pub fn values<'a>(&'a self) -> impl Iterator<Item = Inst> + 'a {
        self.values.iter().cloned()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "env={{")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "}}")
    }
}
