//! Output pipeline: turns the reasoning loop's delta stream into
//! ordered text deltas and a synthesized audio stream.

pub mod pipeline;
pub mod segmenter;

pub use pipeline::OutputPipeline;
pub use segmenter::Segmenter;
