//! Spreadsheet ingest and merge engine.
//!
//! Pipeline: parse (CSV/XLSX) -> region detection -> type inference ->
//! column matching -> merge plan -> batched encrypted writes into the
//! chat's schema in the shared store.

mod engine;
mod infer;
mod matcher;
mod merge;
mod parser;

pub use engine::{IngestReport, SpreadsheetIngest, BATCH_SIZE};
pub use infer::{
    infer_column_type, ColumnInference, InferredType, HIGH_CONFIDENCE, MAJORITY_CONFIDENCE,
    MEDIUM_CONFIDENCE, SAMPLE_SIZE,
};
pub use matcher::{
    column_similarity, match_columns, normalize_column_name, sanitize_identifier,
    unmatched_existing, ColumnDisposition, ColumnMatch, MAP_THRESHOLD, RENAME_THRESHOLD,
};
pub use merge::{
    detect_key_columns, plan_merge, ColumnRename, MergeOptions, MergePlan, MergeStrategy,
    NullPolicy,
};
pub use parser::{parse_file, FileKind, ParsedSheet};
