//! Drivers built on the MFD operator: steady-state continuation and the
//! layered-column benchmark.

pub mod layered_column;
pub mod steady;

pub use layered_column::{CellRecord, ColumnErrors, ColumnReport, LayeredColumn};
pub use steady::{advance_to_steady_state, FlowModel, SteadyState, SteadyStateParams};
