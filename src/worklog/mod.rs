// SPDX-License-Identifier: Apache-2.0

//! Durable record of how far each watched file has been read.

mod handle;
pub mod range;
pub mod store;
mod writer;

pub use handle::{UpdateRequest, Worklog};
pub use range::{FileRange, UNKNOWN_IDENTITY};
pub use writer::{WorklogConfig, WorklogWriter};
