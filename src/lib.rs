//! Typthon Thunks - executable thunk pool for compiled programs
//!
//! A thunk is a tiny stub of machine code paired with two words of data
//! (context and target). Every stub of a heap jumps to the same common stub,
//! which finds the data cell of the thunk that was entered and dispatches on
//! it. This lets generated code hand out distinct callable addresses for
//! closures, delegates and callbacks without emitting code at run time.
//!
//! Architecture:
//! - `layout` - page/stub/cell constants and code<->data pairing
//! - `arch` - address tagging and per-architecture stub encodings
//! - `provider` - where block pairs come from (OS mappings or process heap)
//! - `blocks` - batches provider mappings into single block pairs
//! - `heap` - per-consumer allocator with an in-place free list
//! - `ffi` - C ABI for generated code

pub mod arch;
pub mod blocks;
pub mod config;
pub mod error;
pub mod ffi;
pub mod heap;
pub mod layout;
pub mod logging;
pub mod provider;

pub use blocks::BlockSource;
pub use config::ThunkConfig;
pub use error::ThunkError;
pub use heap::{HeapStats, ThunkAddress, ThunkData, ThunkHeap};
pub use layout::{RegionArrangement, ThunkLayout};
pub use provider::{InMemoryProvider, MappingProvider, OsMappingProvider};

/// Initialize logging and the process-wide block source
///
/// Optional: heaps work without it, but configuration errors are only
/// reported once a subscriber is installed.
pub fn init() {
    let config = ThunkConfig::from_env();
    logging::init_with_config(config.log);
    let _ = BlockSource::global();
}
