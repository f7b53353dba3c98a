// Copyright (c) 2017-2020 Fabian Schuiki

//! The optimization infrastructure.
//!
//! This module implements the `Pass` trait all optimizations implement, the
//! context they run in, and the pipeline that drives them over a method.

mod pass;
mod pipeline;
pub mod prelude;

pub use self::pass::*;
pub use self::pipeline::*;
