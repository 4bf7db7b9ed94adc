//! Native-frame symbolization
//!
//! Maps raw instruction pointers from the capture stream back to function,
//! file and line using the DWARF debug info of the objects the traced
//! process had loaded. Lookups are generation-aware: each memory-map
//! rotation of the traced process starts a new generation, and a frame only
//! resolves against the generation it was captured under.

pub mod interval_map;
pub mod resolver;

pub use interval_map::IntervalMap;
pub use resolver::{LoadedObject, ResolvedFrame, SymbolResolver};
