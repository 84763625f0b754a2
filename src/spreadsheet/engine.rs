//! Upload ingest: parse, infer, reconcile, and write encrypted rows
//! into a chat's schema in the shared store.
//!
//! Schema-change statements are applied one at a time and log-and-
//! continue on failure. Row writes go in chunks of 1000, one
//! transaction per chunk; a chunk that fails wholesale falls back to
//! per-row writes so one bad row cannot sink its neighbours.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::MAX_UPLOAD_BYTES;
use crate::db::postgres::quote_ident;
use crate::db::SpreadsheetStore;
use crate::error::{NeoBaseError, Result};
use crate::spreadsheet::infer::{infer_column_type, ColumnInference};
use crate::spreadsheet::matcher::sanitize_identifier;
use crate::spreadsheet::merge::{
    comparison_form, detect_key_columns, plan_merge, ColumnRename, MergeOptions, MergePlan,
    MergeStrategy, NullPolicy,
};
use crate::spreadsheet::parser::{parse_file, ParsedSheet};

/// Rows per insert chunk; each chunk runs in one transaction.
pub const BATCH_SIZE: usize = 1000;

/// Outcome of one upload.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub table: String,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub rows_failed: u64,
    pub columns_added: Vec<String>,
    pub columns_dropped: Vec<String>,
    pub renames: Vec<ColumnRename>,
    /// Inferred type per target column, for new columns.
    pub inferred_types: HashMap<String, ColumnInference>,
}

/// The ingest engine over the shared store.
pub struct SpreadsheetIngest {
    store: Arc<SpreadsheetStore>,
}

impl SpreadsheetIngest {
    /// Creates the engine.
    pub fn new(store: Arc<SpreadsheetStore>) -> Self {
        Self { store }
    }

    /// Ingests one uploaded file into `table_name` under the chat's
    /// schema.
    pub async fn upload(
        &self,
        chat_id: &str,
        table_name: &str,
        file_name: &str,
        bytes: &[u8],
        strategy: MergeStrategy,
        options: &MergeOptions,
    ) -> Result<IngestReport> {
        if bytes.len() as u64 > MAX_UPLOAD_BYTES {
            return Err(NeoBaseError::invalid_input(format!(
                "File exceeds the {} MB upload limit",
                MAX_UPLOAD_BYTES / (1024 * 1024)
            )));
        }

        let sheet = parse_file(file_name, bytes)?;
        let table = sanitize_identifier(table_name);
        let schema = SpreadsheetStore::schema_for_chat(chat_id);

        let mut report = IngestReport {
            table: table.clone(),
            ..Default::default()
        };

        // Appending nothing is a no-op; the table is left untouched.
        if sheet.is_empty() && strategy == MergeStrategy::Append {
            return Ok(report);
        }

        self.store.ensure_schema(&schema).await?;

        let existing = self.existing_columns(&schema, &table).await?;
        let plan = plan_merge(strategy, options, &existing, &sheet.headers);

        for (i, header) in sheet.headers.iter().enumerate() {
            if let Some(target) = plan.mapping.get(header) {
                let column: Vec<&str> = sheet.rows.iter().map(|r| r[i].as_str()).collect();
                report
                    .inferred_types
                    .insert(target.clone(), infer_column_type(&column));
            }
        }

        self.apply_schema_changes(&schema, &table, strategy, &plan, &existing, &mut report)
            .await?;

        // Rows keyed by target column; column order follows the sheet
        // so key detection can fall back to "the first three columns".
        let rows = project_rows(&sheet, &plan);
        let columns = target_columns(&sheet.headers, &plan);

        match strategy {
            MergeStrategy::Replace | MergeStrategy::Append => {
                self.insert_rows(&schema, &table, &columns, &rows, &mut report)
                    .await?;
            }
            MergeStrategy::Merge => {
                let merged_defaults = MergeOptions {
                    update_existing: true,
                    insert_new: true,
                    delete_missing: false,
                    ..*options
                };
                self.merge_rows(&schema, &table, &columns, &rows, &merged_defaults, &mut report)
                    .await?;
            }
            MergeStrategy::SmartMerge => {
                self.merge_rows(&schema, &table, &columns, &rows, options, &mut report)
                    .await?;
            }
        }

        info!(
            chat_id,
            table = %report.table,
            inserted = report.rows_inserted,
            updated = report.rows_updated,
            deleted = report.rows_deleted,
            failed = report.rows_failed,
            "Upload ingested"
        );
        Ok(report)
    }

    async fn existing_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT column_name FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| NeoBaseError::query(format!("failed to inspect '{table}': {e}")))?;

        Ok(rows
            .into_iter()
            .map(|(name,)| name)
            .filter(|name| !name.starts_with('_'))
            .collect())
    }

    /// Applies DDL for the plan. Statements run individually and
    /// log-and-continue on failure.
    async fn apply_schema_changes(
        &self,
        schema: &str,
        table: &str,
        strategy: MergeStrategy,
        plan: &MergePlan,
        existing: &[String],
        report: &mut IngestReport,
    ) -> Result<()> {
        let qualified = format!("{}.{}", quote_ident(schema), quote_ident(table));
        let mut statements: Vec<String> = Vec::new();

        let table_exists = !existing.is_empty() || self.table_exists(schema, table).await?;

        if strategy == MergeStrategy::Replace && table_exists {
            statements.push(format!("DROP TABLE IF EXISTS {qualified}"));
        }

        if strategy == MergeStrategy::Replace || !table_exists {
            let data_columns: String = plan
                .columns_to_add
                .iter()
                .map(|c| format!(", {} TEXT", quote_ident(c)))
                .collect();
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {qualified} (\
                 _id BIGSERIAL PRIMARY KEY, \
                 _created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                 _updated_at TIMESTAMPTZ NOT NULL DEFAULT now()\
                 {data_columns})"
            ));
            report.columns_added = plan.columns_to_add.clone();
        } else {
            for rename in &plan.renames {
                statements.push(format!(
                    "ALTER TABLE {qualified} RENAME COLUMN {} TO {}",
                    quote_ident(&rename.from),
                    quote_ident(&rename.to)
                ));
            }
            report.renames = plan.renames.clone();

            for column in &plan.columns_to_add {
                statements.push(format!(
                    "ALTER TABLE {qualified} ADD COLUMN IF NOT EXISTS {} TEXT",
                    quote_ident(column)
                ));
            }
            report.columns_added = plan.columns_to_add.clone();

            for column in &plan.columns_to_drop {
                statements.push(format!(
                    "ALTER TABLE {qualified} DROP COLUMN IF EXISTS {}",
                    quote_ident(column)
                ));
            }
            report.columns_dropped = plan.columns_to_drop.clone();
        }

        // Record inferred types as column comments so introspection
        // can show something better than "text".
        for (column, inference) in &report.inferred_types {
            statements.push(format!(
                "COMMENT ON COLUMN {qualified}.{} IS '{}'",
                quote_ident(column),
                inference.inferred.as_str()
            ));
        }

        for statement in statements {
            if let Err(e) = sqlx::query(&statement).execute(self.store.pool()).await {
                warn!(statement, "Schema statement failed, continuing: {e}");
            }
        }
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT count(*) FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(schema)
        .bind(table)
        .fetch_one(self.store.pool())
        .await
        .map_err(|e| NeoBaseError::query(e.to_string()))?;
        Ok(row.0 > 0)
    }

    /// Inserts rows in encrypted chunks.
    async fn insert_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        rows: &[HashMap<String, String>],
        report: &mut IngestReport,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        for chunk in rows.chunks(BATCH_SIZE) {
            match self.insert_chunk(schema, table, columns, chunk).await {
                Ok(count) => report.rows_inserted += count,
                Err(e) => {
                    // One bad row poisons a multi-row insert; retry the
                    // chunk row by row so the rest survives.
                    warn!(table, "Chunk insert failed, retrying per row: {e}");
                    for row in chunk {
                        match self
                            .insert_chunk(schema, table, columns, std::slice::from_ref(row))
                            .await
                        {
                            Ok(count) => report.rows_inserted += count,
                            Err(row_err) => {
                                warn!(table, "Row insert failed: {row_err}");
                                report.rows_failed += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn insert_chunk(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        chunk: &[HashMap<String, String>],
    ) -> Result<u64> {
        if columns.is_empty() || chunk.is_empty() {
            return Ok(0);
        }

        let qualified = format!("{}.{}", quote_ident(schema), quote_ident(table));
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut placeholders = Vec::with_capacity(chunk.len());
        let mut arg = 1usize;
        for _ in chunk {
            let row_placeholders: Vec<String> =
                (0..columns.len()).map(|_| { let p = format!("${arg}"); arg += 1; p }).collect();
            placeholders.push(format!("({})", row_placeholders.join(", ")));
        }

        let sql = format!(
            "INSERT INTO {qualified} ({column_list}) VALUES {}",
            placeholders.join(", ")
        );

        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(|e| NeoBaseError::query(format!("failed to open transaction: {e}")))?;

        let mut query = sqlx::query(&sql);
        for row in chunk {
            for column in columns {
                let value = row.get(column).map(String::as_str).unwrap_or("");
                query = query.bind(self.store.cipher().encrypt(value)?);
            }
        }
        let done = query
            .execute(&mut *tx)
            .await
            .map_err(|e| NeoBaseError::query(format!("insert failed: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| NeoBaseError::query(format!("commit failed: {e}")))?;

        Ok(done.rows_affected())
    }

    /// Key-based reconcile: update matched rows, insert the rest,
    /// optionally delete rows missing from the upload.
    async fn merge_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        rows: &[HashMap<String, String>],
        options: &MergeOptions,
        report: &mut IngestReport,
    ) -> Result<()> {
        if columns.is_empty() {
            return Ok(());
        }
        let key_columns = detect_key_columns(columns);

        let existing = self.load_existing(schema, table, columns).await?;
        let mut existing_by_key: HashMap<String, i64> = HashMap::new();
        for (id, row) in &existing {
            existing_by_key.insert(row_key(row, &key_columns, options), *id);
        }

        let mut matched_ids: Vec<i64> = Vec::new();
        let mut to_insert: Vec<HashMap<String, String>> = Vec::new();
        let mut to_update: Vec<(i64, HashMap<String, String>)> = Vec::new();

        for row in rows {
            let key = row_key(row, &key_columns, options);
            match existing_by_key.get(&key) {
                Some(id) => {
                    matched_ids.push(*id);
                    if options.update_existing {
                        to_update.push((*id, row.clone()));
                    }
                }
                None => {
                    if options.insert_new {
                        to_insert.push(row.clone());
                    }
                }
            }
        }

        for chunk in to_update.chunks(BATCH_SIZE) {
            for (id, row) in chunk {
                match self
                    .update_row(schema, table, *id, row, columns, options)
                    .await
                {
                    Ok(true) => report.rows_updated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(table, id, "Row update failed: {e}");
                        report.rows_failed += 1;
                    }
                }
            }
        }

        self.insert_rows(schema, table, columns, &to_insert, report)
            .await?;

        if options.delete_missing {
            let missing: Vec<i64> = existing
                .iter()
                .map(|(id, _)| *id)
                .filter(|id| !matched_ids.contains(id))
                .collect();
            if !missing.is_empty() {
                let qualified = format!("{}.{}", quote_ident(schema), quote_ident(table));
                let done = sqlx::query(&format!("DELETE FROM {qualified} WHERE _id = ANY($1)"))
                    .bind(&missing)
                    .execute(self.store.pool())
                    .await
                    .map_err(|e| NeoBaseError::query(format!("delete failed: {e}")))?;
                report.rows_deleted = done.rows_affected();
            }
        }

        Ok(())
    }

    /// Loads existing rows (decrypted) keyed by `_id`.
    async fn load_existing(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
    ) -> Result<Vec<(i64, HashMap<String, String>)>> {
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let qualified = format!("{}.{}", quote_ident(schema), quote_ident(table));
        let sql = format!("SELECT _id, {column_list} FROM {qualified}");

        use sqlx::Row as _;
        let rows = sqlx::query(&sql)
            .fetch_all(self.store.pool())
            .await
            .map_err(|e| NeoBaseError::query(format!("failed to read '{table}': {e}")))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row
                .try_get("_id")
                .map_err(|e| NeoBaseError::query(e.to_string()))?;
            let mut values = HashMap::with_capacity(columns.len());
            for column in columns {
                let stored: Option<String> = row
                    .try_get(column.as_str())
                    .map_err(|e| NeoBaseError::query(e.to_string()))?;
                let plain = match stored {
                    Some(v) => self.store.cipher().decrypt(&v)?,
                    None => String::new(),
                };
                values.insert(column.clone(), plain);
            }
            out.push((id, values));
        }
        Ok(out)
    }

    async fn update_row(
        &self,
        schema: &str,
        table: &str,
        id: i64,
        row: &HashMap<String, String>,
        columns: &[String],
        options: &MergeOptions,
    ) -> Result<bool> {
        let mut assignments: Vec<String> = Vec::new();
        let mut values: Vec<Option<String>> = Vec::new();
        let mut arg = 1usize;

        for column in columns {
            let incoming = row.get(column).map(String::as_str).unwrap_or("");
            if incoming.is_empty() {
                match options.null_policy {
                    NullPolicy::Keep => continue,
                    NullPolicy::Empty => {
                        assignments.push(format!("{} = ${arg}", quote_ident(column)));
                        values.push(Some(String::new()));
                        arg += 1;
                    }
                    NullPolicy::Null => {
                        assignments.push(format!("{} = NULL", quote_ident(column)));
                    }
                }
            } else {
                assignments.push(format!("{} = ${arg}", quote_ident(column)));
                values.push(Some(self.store.cipher().encrypt(incoming)?));
                arg += 1;
            }
        }

        if assignments.is_empty() {
            return Ok(false);
        }
        assignments.push("_updated_at = now()".to_string());

        let qualified = format!("{}.{}", quote_ident(schema), quote_ident(table));
        let sql = format!(
            "UPDATE {qualified} SET {} WHERE _id = ${arg}",
            assignments.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for value in values.into_iter().flatten() {
            query = query.bind(value);
        }
        query = query.bind(id);
        query
            .execute(self.store.pool())
            .await
            .map_err(|e| NeoBaseError::query(format!("update failed: {e}")))?;
        Ok(true)
    }

    /// Lists the data tables in a chat's schema.
    pub async fn list_tables(&self, chat_id: &str) -> Result<Vec<String>> {
        let schema = SpreadsheetStore::schema_for_chat(chat_id);
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = $1 ORDER BY table_name",
        )
        .bind(&schema)
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| NeoBaseError::query(format!("failed to list tables: {e}")))?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// Reads a page of decrypted rows from one table.
    pub async fn table_rows(
        &self,
        chat_id: &str,
        table: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HashMap<String, String>>> {
        let schema = SpreadsheetStore::schema_for_chat(chat_id);
        let table = sanitize_identifier(table);
        let columns = self.existing_columns(&schema, &table).await?;
        if columns.is_empty() {
            return Ok(Vec::new());
        }

        let all = self.load_existing(&schema, &table, &columns).await?;
        Ok(all
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(id, mut values)| {
                values.insert("_id".to_string(), id.to_string());
                values
            })
            .collect())
    }

    /// Deletes one row by its internal id.
    pub async fn delete_row(&self, chat_id: &str, table: &str, row_id: i64) -> Result<u64> {
        let schema = SpreadsheetStore::schema_for_chat(chat_id);
        let table = sanitize_identifier(table);
        let qualified = format!("{}.{}", quote_ident(&schema), quote_ident(&table));
        let done = sqlx::query(&format!("DELETE FROM {qualified} WHERE _id = $1"))
            .bind(row_id)
            .execute(self.store.pool())
            .await
            .map_err(|e| NeoBaseError::query(format!("delete failed: {e}")))?;
        Ok(done.rows_affected())
    }

    /// Drops one table from a chat's schema.
    pub async fn drop_table(&self, chat_id: &str, table: &str) -> Result<()> {
        let schema = SpreadsheetStore::schema_for_chat(chat_id);
        let table = sanitize_identifier(table);
        let qualified = format!("{}.{}", quote_ident(&schema), quote_ident(&table));
        sqlx::query(&format!("DROP TABLE IF EXISTS {qualified}"))
            .execute(self.store.pool())
            .await
            .map_err(|e| NeoBaseError::query(format!("drop failed: {e}")))?;
        Ok(())
    }

    /// Exports a table as CSV, decrypted.
    pub async fn export_csv(&self, chat_id: &str, table: &str) -> Result<Vec<u8>> {
        let schema = SpreadsheetStore::schema_for_chat(chat_id);
        let table = sanitize_identifier(table);
        let columns = self.existing_columns(&schema, &table).await?;
        let rows = self.load_existing(&schema, &table, &columns).await?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&columns)
            .map_err(|e| NeoBaseError::internal(format!("csv write failed: {e}")))?;
        for (_, row) in rows {
            let record: Vec<&str> = columns
                .iter()
                .map(|c| row.get(c).map(String::as_str).unwrap_or(""))
                .collect();
            writer
                .write_record(record)
                .map_err(|e| NeoBaseError::internal(format!("csv write failed: {e}")))?;
        }
        writer
            .into_inner()
            .map_err(|e| NeoBaseError::internal(format!("csv write failed: {e}")))
    }
}

/// Projects parsed rows onto their target columns via the plan's
/// mapping. Unmapped incoming columns are dropped.
fn project_rows(sheet: &ParsedSheet, plan: &MergePlan) -> Vec<HashMap<String, String>> {
    sheet
        .rows
        .iter()
        .map(|row| {
            let mut projected = HashMap::new();
            for (i, header) in sheet.headers.iter().enumerate() {
                if let Some(target) = plan.mapping.get(header) {
                    projected.insert(target.clone(), row[i].clone());
                }
            }
            projected
        })
        .collect()
}

/// Target columns in sheet order, deduplicated.
fn target_columns(headers: &[String], plan: &MergePlan) -> Vec<String> {
    let mut columns: Vec<String> = Vec::with_capacity(headers.len());
    for header in headers {
        if let Some(target) = plan.mapping.get(header) {
            if !columns.contains(target) {
                columns.push(target.clone());
            }
        }
    }
    columns
}

/// Composite comparison key for one row.
fn row_key(
    row: &HashMap<String, String>,
    key_columns: &[String],
    options: &MergeOptions,
) -> String {
    key_columns
        .iter()
        .map(|c| comparison_form(row.get(c).map(String::as_str).unwrap_or(""), options))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}
