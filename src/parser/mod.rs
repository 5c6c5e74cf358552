//! Output-stream parsing: the three-layer lossy pipeline plus the two
//! concrete stream parsers (progress, diagnostic) and the shared
//! segment-number extraction they both rely on.

pub mod diagnostic;
pub mod pipeline;
pub mod progress;
pub mod segment_number;

pub use diagnostic::DiagnosticStreamParser;
pub use pipeline::PipelineHealth;
pub use progress::{ProgressStreamParser, ProgressUpdate};
