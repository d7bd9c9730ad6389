pub mod analysis;
pub mod dense;
pub mod error;
pub mod mesh;
pub mod mfd;
pub mod output;
pub mod solver;
pub mod sparse;
pub mod stats;
