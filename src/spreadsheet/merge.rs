//! Merge strategies and reconciliation planning.
//!
//! Decides, before any SQL runs, which columns are added, dropped, or
//! renamed and how incoming rows pair up with existing ones. The
//! engine then applies the plan in batched transactions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{NeoBaseError, Result};
use crate::spreadsheet::matcher::{self, ColumnDisposition, ColumnMatch};

/// The four upload reconciliation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Drop and recreate the table; keep only the uploaded rows.
    Replace,
    /// Keep existing rows; insert every uploaded row.
    Append,
    /// Update rows matched by the detected key; insert the rest.
    Merge,
    /// Fuzzy column matching plus per-flag update/insert/delete.
    SmartMerge,
}

impl MergeStrategy {
    /// Parses the wire form used by the upload command.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "append" => Ok(Self::Append),
            "merge" => Ok(Self::Merge),
            "smart_merge" | "smart-merge" => Ok(Self::SmartMerge),
            other => Err(NeoBaseError::invalid_input(format!(
                "Unknown merge strategy '{other}'"
            ))),
        }
    }
}

/// How empty incoming cells are written during an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullPolicy {
    /// Keep the existing value.
    #[default]
    Keep,
    /// Write an empty string.
    Empty,
    /// Write SQL NULL.
    Null,
}

/// Per-upload option flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MergeOptions {
    pub add_new_columns: bool,
    pub drop_missing_columns: bool,
    pub update_existing: bool,
    pub insert_new: bool,
    pub delete_missing: bool,
    /// Case-insensitive key and cell comparison.
    pub case_insensitive: bool,
    /// Trim whitespace before comparison.
    pub trim_whitespace: bool,
    pub null_policy: NullPolicy,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            add_new_columns: true,
            drop_missing_columns: false,
            update_existing: true,
            insert_new: true,
            delete_missing: false,
            case_insensitive: false,
            trim_whitespace: true,
            null_policy: NullPolicy::Keep,
        }
    }
}

/// A planned column rename.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRename {
    pub from: String,
    pub to: String,
    pub similarity: f64,
}

/// The reconciliation plan for one upload.
#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    /// Incoming column name -> existing (target) column name.
    pub mapping: HashMap<String, String>,
    /// Columns to add, in incoming order (sanitized names).
    pub columns_to_add: Vec<String>,
    /// Existing columns to drop.
    pub columns_to_drop: Vec<String>,
    /// Renames applied to existing columns.
    pub renames: Vec<ColumnRename>,
}

/// Builds the reconciliation plan for an upload against the existing
/// column set.
pub fn plan_merge(
    strategy: MergeStrategy,
    options: &MergeOptions,
    existing: &[String],
    incoming: &[String],
) -> MergePlan {
    let mut plan = MergePlan::default();

    if strategy == MergeStrategy::Replace || existing.is_empty() {
        // A fresh table: every incoming column is created.
        plan.columns_to_add = incoming
            .iter()
            .map(|c| matcher::sanitize_identifier(c))
            .collect();
        for (raw, sanitized) in incoming.iter().zip(plan.columns_to_add.iter()) {
            plan.mapping.insert(raw.clone(), sanitized.clone());
        }
        return plan;
    }

    let matches: Vec<ColumnMatch> = matcher::match_columns(existing, incoming);
    let fuzzy = strategy == MergeStrategy::SmartMerge;

    for column_match in &matches {
        match &column_match.disposition {
            ColumnDisposition::Exact { existing } => {
                plan.mapping
                    .insert(column_match.incoming.clone(), existing.clone());
            }
            ColumnDisposition::RenameCandidate {
                existing,
                similarity,
            } if fuzzy => {
                // Confident match: rename the stored column to the
                // incoming name.
                let target = matcher::sanitize_identifier(&column_match.incoming);
                if target != *existing {
                    plan.renames.push(ColumnRename {
                        from: existing.clone(),
                        to: target.clone(),
                        similarity: *similarity,
                    });
                }
                plan.mapping.insert(column_match.incoming.clone(), target);
            }
            ColumnDisposition::Mapped { existing, .. } if fuzzy => {
                // Map but keep the existing name.
                plan.mapping
                    .insert(column_match.incoming.clone(), existing.clone());
            }
            _ => {
                // New column (or fuzzy match outside smart merge).
                if options.add_new_columns {
                    let name = matcher::sanitize_identifier(&column_match.incoming);
                    plan.columns_to_add.push(name.clone());
                    plan.mapping.insert(column_match.incoming.clone(), name);
                }
            }
        }
    }

    if fuzzy && options.drop_missing_columns {
        plan.columns_to_drop = matcher::unmatched_existing(existing, &matches);
    }

    plan
}

/// Key columns used by the `merge` strategy to pair rows: columns named
/// `id`, `_id`, `*_id`, `key`, or `code`; otherwise the first three
/// columns form a composite key.
pub fn detect_key_columns(columns: &[String]) -> Vec<String> {
    let keys: Vec<String> = columns
        .iter()
        .filter(|name| {
            let lower = name.to_lowercase();
            lower == "id"
                || lower == "_id"
                || lower.ends_with("_id")
                || lower == "key"
                || lower == "code"
        })
        .cloned()
        .collect();

    if !keys.is_empty() {
        return keys;
    }
    columns.iter().take(3).cloned().collect()
}

/// Normalizes a cell value for comparison under the option flags.
pub fn comparison_form(value: &str, options: &MergeOptions) -> String {
    let mut v = if options.trim_whitespace {
        value.trim().to_string()
    } else {
        value.to_string()
    };
    if options.case_insensitive {
        v = v.to_lowercase();
    }
    v
}
