// Copyright (c) 2017-2020 Fabian Schuiki

//! Re-exports of the items most passes need.

pub use crate::opt::{Pass, PassContext};
