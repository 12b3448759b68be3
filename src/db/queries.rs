//! SQL query constants, identifier validation and DDL builders
//!
//! Catalog queries are parameterized: `$1` schema, `$2` table, `$3` column
//! (NULL for table-wide lookups). Identifiers that end up interpolated into
//! DDL text must pass [`validate_identifier`] first; that allow-list is the
//! engine's SQL-injection boundary. Malformed names are rejected, never
//! escaped into acceptability.

use crate::error::{AppError, AppResult};
use once_cell::sync::Lazy;
use regex::Regex;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]{0,62}$").expect("identifier pattern is valid"));

static INJECTION_PATTERNS: &[(&str, &str)] = &[
    (";", "statement terminator"),
    ("--", "line comment"),
    ("/*", "block comment"),
    ("*/", "block comment"),
    ("'", "string quote"),
    ("\"", "identifier quote"),
    ("\\", "escape character"),
    ("\0", "null byte"),
];

pub const DEFAULT_SCHEMA: &str = "public";

/// Validate a table/column identifier, optionally schema-qualified (`schema.table`).
pub fn validate_identifier(name: &str) -> AppResult<()> {
    if name.is_empty() {
        return Err(AppError::QueryParsing("Identifier must not be empty".to_string()));
    }

    if let Some((pattern, what)) = find_injection_pattern(name) {
        return Err(AppError::QueryParsing(format!(
            "Identifier '{}' contains a {} ('{}')",
            name.escape_debug(),
            what,
            pattern.escape_debug()
        )));
    }

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 || parts.iter().any(|p| !IDENTIFIER.is_match(p)) {
        return Err(AppError::QueryParsing(format!(
            "Invalid identifier '{}'. Must start with a letter or underscore and contain only letters, digits, underscores.",
            name
        )));
    }

    Ok(())
}

/// First injection marker found in `name`, with a human-readable label.
pub fn find_injection_pattern(name: &str) -> Option<(&'static str, &'static str)> {
    INJECTION_PATTERNS
        .iter()
        .find(|(pattern, _)| name.contains(pattern))
        .copied()
}

/// Split `schema.table` into its parts; unqualified names live in `public`.
pub fn split_qualified(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => (DEFAULT_SCHEMA, name),
    }
}

pub const TABLE_EXISTS: &str = r#"
    SELECT EXISTS (
        SELECT 1
        FROM information_schema.tables
        WHERE table_schema::text = $1
            AND table_name::text = $2
            AND table_type = 'BASE TABLE'
    ) AS table_exists
"#;

pub const COLUMN_DATA_TYPE: &str = r#"
    SELECT format_type(a.atttypid, a.atttypmod) AS data_type
    FROM pg_attribute a
    JOIN pg_class c ON c.oid = a.attrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname::text = $1
        AND c.relname::text = $2
        AND a.attname::text = $3
        AND a.attnum > 0
        AND NOT a.attisdropped
"#;

pub const GET_PRIMARY_KEYS: &str = r#"
    SELECT kcu.column_name::text AS column_name
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
        ON tc.constraint_name = kcu.constraint_name
        AND tc.table_schema = kcu.table_schema
    WHERE tc.constraint_type = 'PRIMARY KEY'
        AND tc.table_schema::text = $1
        AND tc.table_name::text = $2
    ORDER BY kcu.ordinal_position
"#;

pub const LIST_TABLES: &str = r#"
    SELECT
        CASE WHEN n.nspname = 'public' THEN c.relname::text
             ELSE n.nspname::text || '.' || c.relname::text
        END AS name
    FROM pg_catalog.pg_class c
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind IN ('r','p')
        AND n.nspname <> 'pg_catalog'
        AND n.nspname !~ '^pg_toast'
        AND n.nspname <> 'information_schema'
    ORDER BY n.nspname, c.relname
"#;

pub const FOREIGN_KEYS_REFERENCING: &str = r#"
    SELECT
        tc.constraint_name::text AS constraint_name,
        CASE WHEN tc.table_schema = 'public' THEN tc.table_name::text
             ELSE tc.table_schema::text || '.' || tc.table_name::text
        END AS source_table,
        kcu.column_name::text AS source_column,
        CASE WHEN ccu.table_schema = 'public' THEN ccu.table_name::text
             ELSE ccu.table_schema::text || '.' || ccu.table_name::text
        END AS target_table,
        ccu.column_name::text AS target_column,
        rc.update_rule::text AS on_update,
        rc.delete_rule::text AS on_delete
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
        ON tc.constraint_name = kcu.constraint_name
        AND tc.table_schema = kcu.table_schema
    JOIN information_schema.constraint_column_usage ccu
        ON ccu.constraint_name = tc.constraint_name
        AND ccu.constraint_schema = tc.table_schema
    JOIN information_schema.referential_constraints rc
        ON rc.constraint_name = tc.constraint_name
        AND rc.constraint_schema = tc.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY'
        AND (
            (ccu.table_schema::text = $1
                AND ccu.table_name::text = $2
                AND ($3::text IS NULL OR ccu.column_name::text = $3))
            OR ($3::text IS NOT NULL
                AND tc.table_schema::text = $1
                AND tc.table_name::text = $2
                AND kcu.column_name::text = $3)
        )
    ORDER BY tc.table_name, tc.constraint_name
"#;

pub const VIEWS_FOR_TABLE: &str = r#"
    SELECT DISTINCT
        CASE WHEN v.view_schema = 'public' THEN v.view_name::text
             ELSE v.view_schema::text || '.' || v.view_name::text
        END AS view_name,
        pg_get_viewdef(format('%I.%I', v.view_schema, v.view_name)::regclass, true) AS definition
    FROM information_schema.view_table_usage v
    WHERE v.table_schema::text = $1
        AND v.table_name::text = $2
    ORDER BY view_name
"#;

pub const VIEWS_FOR_COLUMN: &str = r#"
    SELECT DISTINCT
        CASE WHEN v.view_schema = 'public' THEN v.view_name::text
             ELSE v.view_schema::text || '.' || v.view_name::text
        END AS view_name,
        pg_get_viewdef(format('%I.%I', v.view_schema, v.view_name)::regclass, true) AS definition
    FROM information_schema.view_column_usage v
    WHERE v.table_schema::text = $1
        AND v.table_name::text = $2
        AND v.column_name::text = $3
    ORDER BY view_name
"#;

pub const TRIGGERS_ON: &str = r#"
    SELECT
        t.tgname::text AS trigger_name,
        c.relname::text AS table_name,
        pg_get_triggerdef(t.oid, true) AS definition
    FROM pg_trigger t
    JOIN pg_class c ON c.oid = t.tgrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    LEFT JOIN pg_proc p ON p.oid = t.tgfoid
    WHERE NOT t.tgisinternal
        AND n.nspname::text = $1
        AND c.relname::text = $2
        AND ($3::text IS NULL
            OR pg_get_triggerdef(t.oid, true) ~* ('\m' || $3 || '\M')
            OR COALESCE(p.prosrc, '') ~* ('\m' || $3 || '\M'))
    ORDER BY t.tgname
"#;

/// Standalone indexes only: indexes that back a constraint are reported as constraints.
pub const INDEXES_ON: &str = r#"
    SELECT
        i.relname::text AS index_name,
        t.relname::text AS table_name,
        COALESCE(array_agg(a.attname::text ORDER BY a.attnum) FILTER (WHERE a.attname IS NOT NULL),
                 ARRAY[]::text[]) AS columns,
        ix.indisunique AS is_unique,
        ix.indisprimary AS is_primary,
        pg_get_indexdef(ix.indexrelid) AS definition
    FROM pg_index ix
    JOIN pg_class t ON t.oid = ix.indrelid
    JOIN pg_class i ON i.oid = ix.indexrelid
    JOIN pg_namespace n ON n.oid = t.relnamespace
    LEFT JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
    WHERE n.nspname::text = $1
        AND t.relname::text = $2
        AND NOT EXISTS (SELECT 1 FROM pg_constraint con WHERE con.conindid = ix.indexrelid)
    GROUP BY i.relname, t.relname, ix.indisunique, ix.indisprimary, ix.indexrelid
    HAVING $3::text IS NULL OR $3::text = ANY(array_agg(a.attname::text))
    ORDER BY i.relname
"#;

pub const CONSTRAINTS_ON: &str = r#"
    SELECT
        con.conname::text AS constraint_name,
        c.relname::text AS table_name,
        con.contype::text AS contype,
        pg_get_constraintdef(con.oid, true) AS definition
    FROM pg_constraint con
    JOIN pg_class c ON c.oid = con.conrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname::text = $1
        AND c.relname::text = $2
        AND con.contype IN ('p', 'u', 'c', 'x')
        AND ($3::text IS NULL OR EXISTS (
            SELECT 1 FROM pg_attribute a
            WHERE a.attrelid = c.oid
                AND a.attnum = ANY(con.conkey)
                AND a.attname::text = $3))
    ORDER BY con.conname
"#;

/// Column list with types, used to replicate a table's shape into staging
pub const TABLE_COLUMNS_DDL: &str = r#"
    SELECT
        a.attname::text AS column_name,
        format_type(a.atttypid, a.atttypmod) AS data_type,
        a.attnotnull AS not_null
    FROM pg_attribute a
    JOIN pg_class c ON c.oid = a.attrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname::text = $1
        AND c.relname::text = $2
        AND a.attnum > 0
        AND NOT a.attisdropped
    ORDER BY a.attnum
"#;

/// DDL text builder. Callers validate identifiers before building.
pub struct SqlBuilder;

impl SqlBuilder {
    /// Quote an identifier (table/column name) safely
    pub fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Quote a possibly schema-qualified name part by part
    pub fn quote_qualified(name: &str) -> String {
        name.split('.')
            .map(Self::quote_ident)
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn rename_table(old: &str, new: &str) -> String {
        // RENAME TO takes a bare name; the schema never changes.
        let (_, bare_new) = split_qualified(new);
        format!(
            "ALTER TABLE {} RENAME TO {}",
            Self::quote_qualified(old),
            Self::quote_ident(bare_new)
        )
    }

    /// Rename that tolerates an already-missing source table
    pub fn rename_table_if_exists(old: &str, new: &str) -> String {
        let (_, bare_new) = split_qualified(new);
        format!(
            "ALTER TABLE IF EXISTS {} RENAME TO {}",
            Self::quote_qualified(old),
            Self::quote_ident(bare_new)
        )
    }

    pub fn drop_column(table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            Self::quote_qualified(table),
            Self::quote_ident(column)
        )
    }

    pub fn rename_column(table: &str, column: &str, new_name: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            Self::quote_qualified(table),
            Self::quote_ident(column),
            Self::quote_ident(new_name)
        )
    }

    pub fn alter_column_type(table: &str, column: &str, data_type: &str) -> String {
        format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
            Self::quote_qualified(table),
            Self::quote_ident(column),
            data_type
        )
    }

    pub fn drop_table(table: &str) -> String {
        format!("DROP TABLE {}", Self::quote_qualified(table))
    }

    pub fn truncate_table(table: &str) -> String {
        format!("TRUNCATE TABLE {}", Self::quote_qualified(table))
    }

    pub fn add_column(table: &str, column: &str, data_type: &str) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            Self::quote_qualified(table),
            Self::quote_ident(column),
            data_type
        )
    }

    pub fn add_constraint(table: &str, constraint: &str, body: &str) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {}",
            Self::quote_qualified(table),
            Self::quote_ident(constraint),
            body
        )
    }

    pub fn drop_constraint(table: &str, constraint: &str) -> String {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
            Self::quote_qualified(table),
            Self::quote_ident(constraint)
        )
    }

    pub fn drop_index(index: &str) -> String {
        format!("DROP INDEX IF EXISTS {}", Self::quote_qualified(index))
    }

    pub fn rename_index(index: &str, new_name: &str) -> String {
        format!(
            "ALTER INDEX IF EXISTS {} RENAME TO {}",
            Self::quote_qualified(index),
            Self::quote_ident(new_name)
        )
    }

    pub fn create_view(view: &str, select_body: &str) -> String {
        format!(
            "CREATE VIEW {} AS {}",
            Self::quote_qualified(view),
            select_body.trim().trim_end_matches(';')
        )
    }

    /// Alias view exposing every column of `table` under `view`
    pub fn create_alias_view(view: &str, table: &str) -> String {
        format!(
            "CREATE VIEW {} AS SELECT * FROM {}",
            Self::quote_qualified(view),
            Self::quote_qualified(table)
        )
    }

    pub fn drop_view(view: &str) -> String {
        format!("DROP VIEW IF EXISTS {}", Self::quote_qualified(view))
    }

    pub fn drop_trigger(trigger: &str, table: &str) -> String {
        format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            Self::quote_ident(trigger),
            Self::quote_qualified(table)
        )
    }

    pub fn create_table_like(new_table: &str, source: &str) -> String {
        format!(
            "CREATE TABLE {} (LIKE {} INCLUDING ALL)",
            Self::quote_qualified(new_table),
            Self::quote_qualified(source)
        )
    }

    pub fn create_table_as(new_table: &str, select: &str) -> String {
        format!("CREATE TABLE {} AS {}", Self::quote_qualified(new_table), select)
    }

    /// Blocks writers until the transaction ends; readers continue.
    pub fn lock_table_exclusive(table: &str) -> String {
        format!("LOCK TABLE {} IN EXCLUSIVE MODE", Self::quote_qualified(table))
    }

    pub fn insert_select_all(target: &str, source: &str) -> String {
        format!(
            "INSERT INTO {} SELECT * FROM {}",
            Self::quote_qualified(target),
            Self::quote_qualified(source)
        )
    }

    pub fn drop_table_if_exists(table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", Self::quote_qualified(table))
    }

    pub fn count_rows(table: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", Self::quote_qualified(table))
    }

    pub fn analyze(table: &str) -> String {
        format!("ANALYZE {}", Self::quote_qualified(table))
    }

    /// Build CREATE DATABASE query
    pub fn create_database(name: &str) -> String {
        format!("CREATE DATABASE {}", Self::quote_ident(name))
    }

    /// Build DROP DATABASE query
    pub fn drop_database(name: &str) -> String {
        format!("DROP DATABASE IF EXISTS {}", Self::quote_ident(name))
    }
}
