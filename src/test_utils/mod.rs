//! Shared helpers of the unit tests
mod common;
mod scripted_kv;

pub(crate) use common::*;
pub(crate) use scripted_kv::*;
