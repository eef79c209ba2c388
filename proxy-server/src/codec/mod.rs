pub mod h264;
pub mod jpeg;

pub use h264::{AccessUnitSplitter, ParameterSetGate};
pub use jpeg::{jpeg_dimensions, JpegScanner};
