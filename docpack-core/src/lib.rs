//! DocPack Core - Columnar Compression for Heterogeneous Document Streams
//!
//! A streaming compressor that turns many rows of one logical field into a
//! single compact binary column. Consecutive values tend to be similar, so
//! the encoder leans on temporal locality:
//!
//! - **Delta encoding**: integers, dates, object ids and short
//!   strings/binaries store zig-zagged differences from the previous value
//! - **Delta of delta**: monotonic timestamps collapse to near-zero
//!   second-order differences
//! - **Scaled doubles**: floats are encoded as decimal-scaled integers,
//!   with the scale chosen (and re-chosen) dynamically per run
//! - **Simple-8b packing**: small deltas pack many-per-64-bit-block under
//!   run-length control bytes
//! - **Interleaving**: streams of nested documents are split into one
//!   sub-column per leaf field against an inferred reference schema
//!
//! # Quick start
//!
//! ```
//! use docpack_core::{ColumnBuilder, Value};
//!
//! let mut builder = ColumnBuilder::new("temperature");
//! builder.append(&Value::Int32(20)).unwrap();
//! builder.append(&Value::Int32(21)).unwrap();
//! builder.skip();
//! builder.append(&Value::Int32(21)).unwrap();
//!
//! let column = builder.finalize();
//! assert_eq!(column.element_count(), 4);
//! ```

pub mod column;

mod error;
mod types;

pub use column::{ColumnBuilder, CompressedColumn};
pub use error::{DocPackError, Result};
pub use types::*;

/// DocPack version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
