//! Dataset-size collectors: `size.data` (per-schema data+index bytes) and
//! `size.binlogs` (total binary log bytes).

pub mod binlogs;
pub mod data;

pub use binlogs::Binlogs;
pub use data::Data;
