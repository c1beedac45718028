//! Signal processing used by the capture pipeline.
pub mod decimate;
pub mod display;
