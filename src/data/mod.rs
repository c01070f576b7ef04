pub mod ingestion;
pub mod models;
pub mod processing;
pub mod templates;
pub mod universe;

pub use ingestion::{HttpJobClient, JobClient, JobHandle, JobStatus, PollResponse};
pub use models::{ContentKind, ItemKey, ResultItem, Symbol};
pub use processing::{html_content, parse_normalized, HttpNormalizer, Normalizer};
pub use templates::TemplateBook;
pub use universe::{HttpUniverseSource, SymbolUniverse, UniverseSource};
