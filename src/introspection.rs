//! Schema Introspection Module
//!
//! Reads the live PostgreSQL catalog into a [`Schema`]. This is the
//! "live schema as source of truth" side of every diff.

use crate::connection::{Connection, Row};
use crate::error::{MigrateError, Result};
use crate::model::{
    strip_outer_parens, Column, Constraint, ConstraintKind, EnumType, ForeignKey, Index, LogicalType,
    ReferentialAction, Schema, Table,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Oldest supported server (identity columns, `pg_get_expr` on partitions)
const MIN_SERVER_VERSION: i64 = 100_000;

static ARRAY_TYPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)\[\]$").expect("valid regex"));
static VARCHAR_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^character varying(?:\((\d+)\))?$").expect("valid regex"));
static CHAR_TYPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^character(?:\((\d+)\))?$").expect("valid regex"));
static NUMERIC_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^numeric(?:\((\d+)(?:,(\d+))?\))?$").expect("valid regex"));
static TIMESTAMP_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^timestamp(?:\(\d+\))? (with|without) time zone$").expect("valid regex"));
static TIME_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^time(?:\(\d+\))? without time zone$").expect("valid regex"));
static CAST_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^('(?:[^']|'')*')::[\w\s."]+(?:\(\d+(?:,\d+)?\))?(?:\[\])?$"#).expect("valid regex"));
static CHECK_DEF: Lazy<Regex> = Lazy::new(|| Regex::new(r"^CHECK \((.*)\)( NOT VALID)?$").expect("valid regex"));

/// Map a `format_type` name to a logical type. Unknown names become `Raw`.
pub fn map_pg_type(name: &str, enums: &HashSet<String>, namespace: &str) -> LogicalType {
    let name = name.trim();

    if let Some(caps) = ARRAY_TYPE.captures(name) {
        return LogicalType::Array {
            element: Box::new(map_pg_type(&caps[1], enums, namespace)),
        };
    }

    match name {
        "boolean" => return LogicalType::Boolean,
        "smallint" => return LogicalType::SmallInt,
        "integer" => return LogicalType::Integer,
        "bigint" => return LogicalType::BigInt,
        "real" => return LogicalType::Real,
        "double precision" => return LogicalType::Double,
        "text" => return LogicalType::text(),
        "bytea" => return LogicalType::Bytes,
        "uuid" => return LogicalType::Uuid,
        "json" => return LogicalType::Json,
        "jsonb" => return LogicalType::Jsonb,
        "date" => return LogicalType::Date,
        "interval" => return LogicalType::Interval,
        _ => {}
    }

    if let Some(caps) = VARCHAR_TYPE.captures(name) {
        return LogicalType::Text {
            max_length: caps.get(1).and_then(|m| m.as_str().parse().ok()),
        };
    }
    if let Some(caps) = CHAR_TYPE.captures(name) {
        return LogicalType::Char {
            length: caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(1),
        };
    }
    if let Some(caps) = NUMERIC_TYPE.captures(name) {
        return LogicalType::Numeric {
            precision: caps.get(1).and_then(|m| m.as_str().parse().ok()),
            scale: caps.get(2).and_then(|m| m.as_str().parse().ok()),
        };
    }
    if let Some(caps) = TIMESTAMP_TYPE.captures(name) {
        return LogicalType::Timestamp {
            with_time_zone: &caps[1] == "with",
        };
    }
    if TIME_TYPE.is_match(name) {
        return LogicalType::Time;
    }

    // format_type qualifies and quotes enum names outside the search path
    let qualified = format!("{}.", namespace);
    let bare = name.strip_prefix(qualified.as_str()).unwrap_or(name);
    let bare = bare.trim_matches('"');
    if enums.contains(bare) {
        return LogicalType::enumeration(bare);
    }

    LogicalType::Raw { sql: name.to_string() }
}

/// `'x'::text` → `'x'`; `NULL` defaults are no default at all
pub fn strip_default_cast(expr: &str) -> Option<String> {
    let expr = expr.trim();
    if expr.is_empty() || expr.eq_ignore_ascii_case("null") || expr.to_ascii_lowercase().starts_with("null::") {
        return None;
    }
    match CAST_LITERAL.captures(expr) {
        Some(caps) => Some(caps[1].to_string()),
        None => Some(expr.to_string()),
    }
}

/// `CHECK ((price > 0))` → `price > 0`, the form authors write
fn check_expression(definition: &str) -> String {
    match CHECK_DEF.captures(definition.trim()) {
        Some(caps) => strip_outer_parens(&caps[1]),
        None => strip_outer_parens(definition),
    }
}

/// Schema introspector for PostgreSQL
pub struct PostgresIntrospector;

impl PostgresIntrospector {
    /// Introspect one namespace into a normalized schema
    pub async fn introspect(conn: &mut dyn Connection, namespace: &str) -> Result<Schema> {
        Self::check_server(conn, namespace).await?;

        let enums = Self::get_enums(conn, namespace).await?;
        let enum_names: HashSet<String> = enums.iter().map(|e| e.name.clone()).collect();

        let mut tables: Vec<Table> = Self::get_table_names(conn, namespace)
            .await?
            .into_iter()
            .map(Table::new)
            .collect();

        Self::get_columns(conn, namespace, &enum_names, &mut tables).await?;
        Self::get_constraints(conn, namespace, &mut tables).await?;
        Self::get_indexes(conn, namespace, &mut tables).await?;

        let schema = Schema {
            name: namespace.to_string(),
            tables,
            enums,
        }
        .normalized();

        info!(
            "Introspected schema '{}' with {} tables, {} enums",
            namespace,
            schema.tables.len(),
            schema.enums.len()
        );

        Ok(schema)
    }

    /// Which of `tables` currently hold at least one row
    pub async fn row_presence(
        conn: &mut dyn Connection,
        namespace: &str,
        tables: &[String],
    ) -> Result<HashMap<String, bool>> {
        let mut presence = HashMap::new();
        for table in tables {
            let sql = format!(
                "SELECT EXISTS (SELECT 1 FROM \"{}\".\"{}\") AS has_rows",
                namespace.replace('"', "\"\""),
                table.replace('"', "\"\"")
            );
            let has_rows = conn
                .query(&sql, &[])
                .await?
                .first()
                .map(|row| row.boolean("has_rows"))
                .transpose()?
                .unwrap_or(false);
            presence.insert(table.clone(), has_rows);
        }
        debug!("Row presence for {} tables: {:?}", tables.len(), presence);
        Ok(presence)
    }

    async fn check_server(conn: &mut dyn Connection, namespace: &str) -> Result<()> {
        let rows = conn
            .query(
                "SELECT current_setting('server_version_num')::int AS server_version",
                &[],
            )
            .await?;
        let version = rows
            .first()
            .ok_or_else(|| MigrateError::UnsupportedCatalog("server did not report a version".into()))?
            .int("server_version")?;
        if version < MIN_SERVER_VERSION {
            return Err(MigrateError::UnsupportedCatalog(format!(
                "server version {} is older than PostgreSQL 10",
                version
            )));
        }

        let rows = conn
            .query(
                "SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1) AS namespace_exists",
                &[namespace],
            )
            .await?;
        let exists = rows
            .first()
            .map(|row| row.boolean("namespace_exists"))
            .transpose()?
            .unwrap_or(false);
        if !exists {
            return Err(MigrateError::UnsupportedCatalog(format!(
                "namespace '{}' does not exist",
                namespace
            )));
        }

        debug!("Server version {} supports introspection", version);
        Ok(())
    }

    async fn get_enums(conn: &mut dyn Connection, namespace: &str) -> Result<Vec<EnumType>> {
        let query = r#"
            SELECT t.typname AS enum_name, e.enumlabel AS label
            FROM pg_type t
            JOIN pg_enum e ON e.enumtypid = t.oid
            JOIN pg_namespace n ON n.oid = t.typnamespace
            WHERE n.nspname = $1
            ORDER BY t.typname, e.enumsortorder
        "#;

        let mut enums: Vec<EnumType> = Vec::new();
        for row in conn.query(query, &[namespace]).await? {
            let name = row.text("enum_name")?;
            let label = row.text("label")?;
            match enums.last_mut() {
                Some(e) if e.name == name => e.labels.push(label),
                _ => enums.push(EnumType { name, labels: vec![label] }),
            }
        }
        Ok(enums)
    }

    async fn get_table_names(conn: &mut dyn Connection, namespace: &str) -> Result<Vec<String>> {
        let query = r#"
            SELECT c.relname AS relation_name
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1
              AND c.relkind IN ('r', 'p')
              AND NOT c.relispartition
            ORDER BY c.relname
        "#;

        conn.query(query, &[namespace])
            .await?
            .iter()
            .map(|row| row.text("relation_name"))
            .collect()
    }

    async fn get_columns(
        conn: &mut dyn Connection,
        namespace: &str,
        enums: &HashSet<String>,
        tables: &mut [Table],
    ) -> Result<()> {
        let query = r#"
            SELECT
                c.relname AS table_name,
                a.attname AS column_name,
                format_type(a.atttypid, a.atttypmod) AS data_type,
                NOT a.attnotnull AS is_nullable,
                pg_get_expr(d.adbin, d.adrelid) AS default_expr,
                a.attidentity::text AS identity_kind,
                a.attgenerated::text AS generated_kind
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
            WHERE n.nspname = $1
              AND c.relkind IN ('r', 'p')
              AND a.attnum > 0
              AND NOT a.attisdropped
            ORDER BY c.relname, a.attnum
        "#;

        for row in conn.query(query, &[namespace]).await? {
            let table_name = row.text("table_name")?;
            let Some(table) = tables.iter_mut().find(|t| t.name == table_name) else {
                continue;
            };
            table.columns.push(Self::column_from_row(&row, enums, namespace)?);
        }
        Ok(())
    }

    fn column_from_row(row: &Row, enums: &HashSet<String>, namespace: &str) -> Result<Column> {
        let data_type = row.text("data_type")?;
        let default = row.opt_text("default_expr")?;
        let identity = !row.opt_text("identity_kind")?.unwrap_or_default().is_empty();
        let generated = !row.opt_text("generated_kind")?.unwrap_or_default().is_empty();

        let mut column = Column::new(row.text("column_name")?, map_pg_type(&data_type, enums, namespace));
        column.nullable = row.boolean("is_nullable")?;
        column.identity = identity;
        if generated {
            // Stored generation expressions live in pg_attrdef as well
            column.generated = default;
        } else if !identity {
            column.default = default.as_deref().and_then(strip_default_cast);
        }
        Ok(column)
    }

    async fn get_constraints(conn: &mut dyn Connection, namespace: &str, tables: &mut [Table]) -> Result<()> {
        let query = r#"
            SELECT
                cl.relname AS table_name,
                con.conname AS constraint_name,
                con.contype::text AS constraint_type,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                    JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                ) AS columns,
                rt.relname AS referenced_table,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
                    JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                ) AS referenced_columns,
                con.confdeltype::text AS on_delete,
                con.confupdtype::text AS on_update,
                con.condeferrable AS is_deferrable,
                pg_get_constraintdef(con.oid) AS definition
            FROM pg_constraint con
            JOIN pg_class cl ON cl.oid = con.conrelid
            JOIN pg_namespace n ON n.oid = cl.relnamespace
            LEFT JOIN pg_class rt ON rt.oid = con.confrelid
            WHERE n.nspname = $1
              AND con.contype IN ('p', 'f', 'u', 'c')
            ORDER BY cl.relname, con.conname
        "#;

        for row in conn.query(query, &[namespace]).await? {
            let table_name = row.text("table_name")?;
            let Some(table) = tables.iter_mut().find(|t| t.name == table_name) else {
                continue;
            };

            let columns = row.text_array("columns")?;
            let kind = match row.text("constraint_type")?.as_str() {
                "p" => ConstraintKind::PrimaryKey { columns },
                "u" => ConstraintKind::Unique { columns },
                "c" => ConstraintKind::Check {
                    expression: check_expression(&row.text("definition")?),
                },
                "f" => ConstraintKind::ForeignKey(ForeignKey {
                    columns,
                    referenced_table: row.text("referenced_table")?,
                    referenced_columns: row.text_array("referenced_columns")?,
                    on_delete: ReferentialAction::from_pg_code(&row.text("on_delete")?),
                    on_update: ReferentialAction::from_pg_code(&row.text("on_update")?),
                    deferrable: row.boolean("is_deferrable")?,
                }),
                other => {
                    return Err(MigrateError::UnsupportedCatalog(format!(
                        "unexpected constraint type '{}' on {}",
                        other, table_name
                    )))
                }
            };

            table.constraints.push(Constraint {
                name: row.text("constraint_name")?,
                kind,
            });
        }
        Ok(())
    }

    async fn get_indexes(conn: &mut dyn Connection, namespace: &str, tables: &mut [Table]) -> Result<()> {
        // Indexes owned by primary key / unique / exclusion constraints are
        // part of the constraint, not standalone indexes.
        let query = r#"
            SELECT
                t.relname AS table_name,
                i.relname AS index_name,
                ix.indisunique AS is_unique,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
                    JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
                    ORDER BY k.ord
                ) AS columns,
                pg_get_expr(ix.indexprs, ix.indrelid) AS expression,
                pg_get_expr(ix.indpred, ix.indrelid) AS predicate
            FROM pg_index ix
            JOIN pg_class t ON t.oid = ix.indrelid
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            WHERE n.nspname = $1
              AND t.relkind IN ('r', 'p')
              AND NOT EXISTS (
                  SELECT 1 FROM pg_constraint con
                  WHERE con.conindid = ix.indexrelid
                    AND con.contype IN ('p', 'u', 'x')
              )
            ORDER BY t.relname, i.relname
        "#;

        for row in conn.query(query, &[namespace]).await? {
            let table_name = row.text("table_name")?;
            let Some(table) = tables.iter_mut().find(|t| t.name == table_name) else {
                continue;
            };
            table.indexes.push(Index {
                name: row.text("index_name")?,
                columns: row.text_array("columns")?,
                unique: row.boolean("is_unique")?,
                expression: row.opt_text("expression")?,
                predicate: row.opt_text("predicate")?,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::ScriptedConnection;
    use crate::diff::DiffEngine;
    use pretty_assertions::assert_eq;

    fn no_enums() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn test_type_mapping_table() {
        let e = no_enums();
        assert_eq!(map_pg_type("boolean", &e, "public"), LogicalType::Boolean);
        assert_eq!(map_pg_type("bigint", &e, "public"), LogicalType::BigInt);
        assert_eq!(map_pg_type("double precision", &e, "public"), LogicalType::Double);
        assert_eq!(map_pg_type("character varying(255)", &e, "public"), LogicalType::varchar(255));
        assert_eq!(
            map_pg_type("character varying", &e, "public"),
            LogicalType::Text { max_length: None }
        );
        assert_eq!(map_pg_type("character(2)", &e, "public"), LogicalType::Char { length: 2 });
        assert_eq!(
            map_pg_type("numeric(10,2)", &e, "public"),
            LogicalType::Numeric { precision: Some(10), scale: Some(2) }
        );
        assert_eq!(
            map_pg_type("numeric", &e, "public"),
            LogicalType::Numeric { precision: None, scale: None }
        );
        assert_eq!(
            map_pg_type("timestamp(3) with time zone", &e, "public"),
            LogicalType::Timestamp { with_time_zone: true }
        );
        assert_eq!(
            map_pg_type("timestamp without time zone", &e, "public"),
            LogicalType::Timestamp { with_time_zone: false }
        );
        assert_eq!(map_pg_type("time without time zone", &e, "public"), LogicalType::Time);
        assert_eq!(
            map_pg_type("integer[]", &e, "public"),
            LogicalType::Array { element: Box::new(LogicalType::Integer) }
        );
    }

    #[test]
    fn test_unknown_types_become_raw() {
        let e = no_enums();
        assert_eq!(
            map_pg_type("tsvector", &e, "public"),
            LogicalType::Raw { sql: "tsvector".into() }
        );
        assert_eq!(
            map_pg_type("time with time zone", &e, "public"),
            LogicalType::Raw { sql: "time with time zone".into() }
        );
    }

    #[test]
    fn test_enum_names_resolve_qualified_and_quoted() {
        let enums: HashSet<String> = ["mood".to_string(), "Status".to_string()].into_iter().collect();
        assert_eq!(map_pg_type("mood", &enums, "app"), LogicalType::enumeration("mood"));
        assert_eq!(map_pg_type("app.mood", &enums, "app"), LogicalType::enumeration("mood"));
        assert_eq!(map_pg_type("\"Status\"", &enums, "app"), LogicalType::enumeration("Status"));
        assert_eq!(
            map_pg_type("mood[]", &enums, "app"),
            LogicalType::Array { element: Box::new(LogicalType::enumeration("mood")) }
        );
    }

    #[test]
    fn test_default_cast_stripping() {
        assert_eq!(strip_default_cast("'ok'::mood"), Some("'ok'".into()));
        assert_eq!(strip_default_cast("'it''s'::character varying"), Some("'it''s'".into()));
        assert_eq!(strip_default_cast("now()"), Some("now()".into()));
        assert_eq!(strip_default_cast("NULL::text"), None);
        assert_eq!(strip_default_cast("0"), Some("0".into()));
    }

    #[test]
    fn test_check_expression_unwrapped() {
        assert_eq!(check_expression("CHECK ((price > 0))"), "price > 0");
        assert_eq!(check_expression("CHECK ((qty >= 0)) NOT VALID"), "qty >= 0");
        assert_eq!(check_expression("CHECK (((a > 0) OR (b > 0)))"), "(a > 0) OR (b > 0)");
    }

    fn column_row(table: &str, name: &str, ty: &str, nullable: bool, default: Option<&str>, identity: &str) -> Row {
        Row::new()
            .with("table_name", table)
            .with("column_name", name)
            .with("data_type", ty)
            .with("is_nullable", nullable)
            .with("default_expr", default)
            .with("identity_kind", identity)
            .with("generated_kind", "")
    }

    fn catalog() -> ScriptedConnection {
        ScriptedConnection::new()
            .respond("server_version", vec![Row::new().with("server_version", 150004i64)])
            .respond("namespace_exists", vec![Row::new().with("namespace_exists", true)])
            .respond(
                "enumlabel",
                vec![
                    Row::new().with("enum_name", "mood").with("label", "sad"),
                    Row::new().with("enum_name", "mood").with("label", "ok"),
                    Row::new().with("enum_name", "mood").with("label", "happy"),
                ],
            )
            .respond(
                "relation_name",
                vec![
                    Row::new().with("relation_name", "posts"),
                    Row::new().with("relation_name", "users"),
                ],
            )
            .respond(
                "attgenerated",
                vec![
                    column_row("posts", "id", "bigint", false, None, "d"),
                    column_row("posts", "user_id", "integer", false, None, ""),
                    column_row("posts", "body", "text", true, None, ""),
                    column_row("users", "id", "integer", false, None, ""),
                    column_row("users", "email", "character varying(255)", false, None, ""),
                    column_row("users", "mood", "mood", true, Some("'ok'::mood"), ""),
                ],
            )
            .respond(
                "indexrelid",
                vec![Row::new()
                    .with("table_name", "posts")
                    .with("index_name", "posts_user_id_idx")
                    .with("is_unique", false)
                    .with("columns", vec!["user_id"])
                    .with("expression", Option::<&str>::None)
                    .with("predicate", Option::<&str>::None)],
            )
            .respond(
                "contype",
                vec![
                    Row::new()
                        .with("table_name", "posts")
                        .with("constraint_name", "posts_pkey")
                        .with("constraint_type", "p")
                        .with("columns", vec!["id"])
                        .with("referenced_table", Option::<&str>::None)
                        .with("referenced_columns", Vec::<&str>::new())
                        .with("on_delete", " ")
                        .with("on_update", " ")
                        .with("is_deferrable", false)
                        .with("definition", "PRIMARY KEY (id)"),
                    Row::new()
                        .with("table_name", "posts")
                        .with("constraint_name", "posts_user_id_fkey")
                        .with("constraint_type", "f")
                        .with("columns", vec!["user_id"])
                        .with("referenced_table", "users")
                        .with("referenced_columns", vec!["id"])
                        .with("on_delete", "c")
                        .with("on_update", "a")
                        .with("is_deferrable", false)
                        .with("definition", "FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE"),
                    Row::new()
                        .with("table_name", "posts")
                        .with("constraint_name", "posts_check")
                        .with("constraint_type", "c")
                        .with("columns", vec!["body"])
                        .with("referenced_table", Option::<&str>::None)
                        .with("referenced_columns", Vec::<&str>::new())
                        .with("on_delete", " ")
                        .with("on_update", " ")
                        .with("is_deferrable", false)
                        .with("definition", "CHECK ((length(body) > 0))"),
                    Row::new()
                        .with("table_name", "users")
                        .with("constraint_name", "users_pkey")
                        .with("constraint_type", "p")
                        .with("columns", vec!["id"])
                        .with("referenced_table", Option::<&str>::None)
                        .with("referenced_columns", Vec::<&str>::new())
                        .with("on_delete", " ")
                        .with("on_update", " ")
                        .with("is_deferrable", false)
                        .with("definition", "PRIMARY KEY (id)"),
                ],
            )
    }

    #[tokio::test]
    async fn test_introspect_reads_full_catalog() {
        let mut conn = catalog();
        let live = PostgresIntrospector::introspect(&mut conn, "public").await.unwrap();

        let declared = Schema::new("public")
            .with_enum(EnumType::new("mood", &["sad", "ok", "happy"]))
            .with_table(
                Table::new("users")
                    .with_column(Column::new("id", LogicalType::Integer))
                    .with_column(Column::new("email", LogicalType::varchar(255)).not_null())
                    .with_column(Column::new("mood", LogicalType::enumeration("mood")).default_expr("'ok'"))
                    .with_constraint(Constraint::primary_key(&["id"])),
            )
            .with_table(
                Table::new("posts")
                    .with_column(Column::new("id", LogicalType::BigInt).identity())
                    .with_column(Column::new("user_id", LogicalType::Integer).not_null())
                    .with_column(Column::new("body", LogicalType::text()))
                    .with_constraint(Constraint::primary_key(&["id"]))
                    .with_constraint(Constraint::check("length(body) > 0"))
                    .with_constraint(
                        Constraint::foreign_key(&["user_id"], "users", &["id"]).on_delete(ReferentialAction::Cascade),
                    )
                    .with_index(Index::new("posts_user_id_idx", &["user_id"])),
            );

        assert!(DiffEngine::diff(&live, &declared).is_empty());
        assert_eq!(live, declared.normalized());
    }

    #[tokio::test]
    async fn test_old_server_is_unsupported() {
        let mut conn = ScriptedConnection::new()
            .respond("server_version", vec![Row::new().with("server_version", 90624i64)]);
        let err = PostgresIntrospector::introspect(&mut conn, "public").await.unwrap_err();
        assert!(matches!(err, MigrateError::UnsupportedCatalog(_)));
    }

    #[tokio::test]
    async fn test_missing_namespace_is_unsupported() {
        let mut conn = ScriptedConnection::new()
            .respond("server_version", vec![Row::new().with("server_version", 160000i64)])
            .respond("namespace_exists", vec![Row::new().with("namespace_exists", false)]);
        let err = PostgresIntrospector::introspect(&mut conn, "ghost").await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_row_presence() {
        let mut conn = ScriptedConnection::new()
            .respond("\"public\".\"users\"", vec![Row::new().with("has_rows", true)])
            .respond("\"public\".\"tags\"", vec![Row::new().with("has_rows", false)]);
        let presence = PostgresIntrospector::row_presence(&mut conn, "public", &["users".into(), "tags".into()])
            .await
            .unwrap();
        assert_eq!(presence.get("users"), Some(&true));
        assert_eq!(presence.get("tags"), Some(&false));
    }
}
