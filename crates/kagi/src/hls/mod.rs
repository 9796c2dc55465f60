mod rewrite;
mod snapshot;

pub use rewrite::ManifestRewriter;
pub use snapshot::{ManifestSnapshot, SegmentEntry};
