//! SQL dialects
//!
//! The planner decides *what* happens and in which order; a [`Dialect`]
//! decides how each operation is spelled and whether it may run inside a
//! transaction.

use crate::model::{Column, Constraint, ConstraintKind, EnumType, Index, LogicalType, Table};
use serde::{Deserialize, Serialize};

/// A single DDL operation, already ordered by the planner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateEnum { enum_type: EnumType },
    AddEnumLabel { name: String, label: String, before: Option<String> },
    /// Replace the type wholesale and re-cast the listed columns
    RecreateEnum { after: EnumType, dependents: Vec<(String, Column)> },
    DropEnum { name: String },
    /// Create with inline columns and constraints; indexes come separately
    CreateTable { table: Table },
    DropTable { name: String },
    RenameTable { from: String, to: String },
    AddColumn { table: String, column: Column },
    DropColumn { table: String, column: String },
    RenameColumn { table: String, from: String, to: String },
    AlterColumn { table: String, before: Column, after: Column },
    CreateIndex { table: String, index: Index },
    DropIndex { name: String },
    AddConstraint { table: String, constraint: Constraint },
    DropConstraint { table: String, name: String },
    RenameConstraint { table: String, from: String, to: String },
}

/// Rendering strategy, one implementation per database
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn render_type(&self, ty: &LogicalType) -> String;

    /// Statements for one operation, executed in order
    fn render(&self, op: &Operation) -> Vec<String>;

    /// Whether the operation may run inside a transaction block
    fn is_transactional(&self, op: &Operation) -> bool;
}

/// PostgreSQL 10+
#[derive(Debug, Clone)]
pub struct PostgresDialect {
    namespace: String,
}

/// Quote an identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_list(names: &[String]) -> String {
    names.iter().map(|n| quote_ident(n)).collect::<Vec<_>>().join(", ")
}

impl PostgresDialect {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// `"schema"."name"`
    fn qualified(&self, name: &str) -> String {
        format!("{}.{}", quote_ident(&self.namespace), quote_ident(name))
    }

    fn column_definition(&self, column: &Column) -> String {
        let mut def = format!("{} {}", quote_ident(&column.name), self.render_type(&column.logical_type));
        if let Some(expr) = &column.generated {
            def.push_str(&format!(" GENERATED ALWAYS AS ({}) STORED", expr));
        }
        if column.identity {
            def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
        }
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            if !column.identity && column.generated.is_none() {
                def.push_str(&format!(" DEFAULT {}", default));
            }
        }
        def
    }

    fn constraint_body(&self, constraint: &Constraint) -> String {
        match &constraint.kind {
            ConstraintKind::PrimaryKey { columns } => format!("PRIMARY KEY ({})", quote_list(columns)),
            ConstraintKind::Unique { columns } => format!("UNIQUE ({})", quote_list(columns)),
            ConstraintKind::Check { expression } => format!("CHECK ({})", expression),
            ConstraintKind::ForeignKey(fk) => {
                let mut sql = format!(
                    "FOREIGN KEY ({}) REFERENCES {} ({})",
                    quote_list(&fk.columns),
                    self.qualified(&fk.referenced_table),
                    quote_list(&fk.referenced_columns)
                );
                if fk.on_delete != Default::default() {
                    sql.push_str(&format!(" ON DELETE {}", fk.on_delete.as_sql()));
                }
                if fk.on_update != Default::default() {
                    sql.push_str(&format!(" ON UPDATE {}", fk.on_update.as_sql()));
                }
                if fk.deferrable {
                    sql.push_str(" DEFERRABLE INITIALLY DEFERRED");
                }
                sql
            }
        }
    }

    fn create_table_sql(&self, table: &Table) -> String {
        let mut lines: Vec<String> = table
            .columns
            .iter()
            .map(|col| format!("    {}", self.column_definition(col)))
            .collect();
        for constraint in &table.constraints {
            lines.push(format!(
                "    CONSTRAINT {} {}",
                quote_ident(&constraint.name),
                self.constraint_body(constraint)
            ));
        }
        format!("CREATE TABLE {} (\n{}\n)", self.qualified(&table.name), lines.join(",\n"))
    }

    fn create_index_sql(&self, table: &str, index: &Index) -> String {
        let key = match &index.expression {
            Some(expr) => expr.clone(),
            None => quote_list(&index.columns),
        };
        let mut sql = format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            quote_ident(&index.name),
            self.qualified(table),
            key
        );
        if let Some(predicate) = &index.predicate {
            sql.push_str(&format!(" WHERE {}", predicate));
        }
        sql
    }

    fn alter_column_sql(&self, table: &str, before: &Column, after: &Column) -> Vec<String> {
        let prefix = format!(
            "ALTER TABLE {} ALTER COLUMN {}",
            self.qualified(table),
            quote_ident(&after.name)
        );
        let mut statements = Vec::new();

        // Generated columns cannot be altered in place
        if before.generated != after.generated {
            if after.generated.is_none() {
                statements.push(format!("{} DROP EXPRESSION", prefix));
            } else {
                statements.push(format!(
                    "ALTER TABLE {} DROP COLUMN {}",
                    self.qualified(table),
                    quote_ident(&before.name)
                ));
                statements.push(format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    self.qualified(table),
                    self.column_definition(after)
                ));
                return statements;
            }
        }

        if before.default.is_some() && (after.default.is_none() || after.identity || before.logical_type != after.logical_type) {
            statements.push(format!("{} DROP DEFAULT", prefix));
        }
        if before.identity && !after.identity {
            statements.push(format!("{} DROP IDENTITY IF EXISTS", prefix));
        }
        if before.logical_type != after.logical_type {
            let ty = self.render_type(&after.logical_type);
            statements.push(format!(
                "{} TYPE {} USING {}::{}",
                prefix,
                ty,
                quote_ident(&after.name),
                ty
            ));
        }
        if before.nullable != after.nullable {
            statements.push(format!(
                "{} {} NOT NULL",
                prefix,
                if after.nullable { "DROP" } else { "SET" }
            ));
        }
        if !before.identity && after.identity {
            statements.push(format!("{} ADD GENERATED BY DEFAULT AS IDENTITY", prefix));
        }
        if let Some(default) = &after.default {
            let dropped = statements.iter().any(|s| s.ends_with("DROP DEFAULT"));
            if !after.identity && (before.default.as_ref() != Some(default) || dropped) {
                statements.push(format!("{} SET DEFAULT {}", prefix, default));
            }
        }
        statements
    }

    fn recreate_enum_sql(&self, after: &EnumType, dependents: &[(String, Column)]) -> Vec<String> {
        let retired = crate::model::truncate_identifier(&format!("{}__old", after.name));
        let mut statements = vec![
            format!(
                "ALTER TYPE {} RENAME TO {}",
                self.qualified(&after.name),
                quote_ident(&retired)
            ),
            self.create_enum_sql(after),
        ];

        for (table, column) in dependents {
            let prefix = format!(
                "ALTER TABLE {} ALTER COLUMN {}",
                self.qualified(table),
                quote_ident(&column.name)
            );
            let ty = self.render_type(&column.logical_type);
            let via = match column.logical_type {
                LogicalType::Array { .. } => "text[]",
                _ => "text",
            };
            if column.default.is_some() {
                statements.push(format!("{} DROP DEFAULT", prefix));
            }
            statements.push(format!(
                "{} TYPE {} USING {}::{}::{}",
                prefix,
                ty,
                quote_ident(&column.name),
                via,
                ty
            ));
            if let Some(default) = &column.default {
                statements.push(format!("{} SET DEFAULT {}", prefix, default));
            }
        }

        statements.push(format!("DROP TYPE {}", self.qualified(&retired)));
        statements
    }

    fn create_enum_sql(&self, enum_type: &EnumType) -> String {
        format!(
            "CREATE TYPE {} AS ENUM ({})",
            self.qualified(&enum_type.name),
            enum_type
                .labels
                .iter()
                .map(|l| quote_literal(l))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn render_type(&self, ty: &LogicalType) -> String {
        match ty {
            LogicalType::Boolean => "boolean".into(),
            LogicalType::SmallInt => "smallint".into(),
            LogicalType::Integer => "integer".into(),
            LogicalType::BigInt => "bigint".into(),
            LogicalType::Real => "real".into(),
            LogicalType::Double => "double precision".into(),
            LogicalType::Numeric { precision: Some(p), scale: Some(s) } => format!("numeric({},{})", p, s),
            LogicalType::Numeric { precision: Some(p), scale: None } => format!("numeric({})", p),
            LogicalType::Numeric { .. } => "numeric".into(),
            LogicalType::Text { max_length: Some(n) } => format!("varchar({})", n),
            LogicalType::Text { max_length: None } => "text".into(),
            LogicalType::Char { length } => format!("char({})", length),
            LogicalType::Bytes => "bytea".into(),
            LogicalType::Uuid => "uuid".into(),
            LogicalType::Json => "json".into(),
            LogicalType::Jsonb => "jsonb".into(),
            LogicalType::Date => "date".into(),
            LogicalType::Time => "time".into(),
            LogicalType::Timestamp { with_time_zone: true } => "timestamptz".into(),
            LogicalType::Timestamp { with_time_zone: false } => "timestamp".into(),
            LogicalType::Interval => "interval".into(),
            LogicalType::Enum { name } => self.qualified(name),
            LogicalType::Array { element } => format!("{}[]", self.render_type(element)),
            LogicalType::Raw { sql } => sql.clone(),
        }
    }

    fn render(&self, op: &Operation) -> Vec<String> {
        match op {
            Operation::CreateEnum { enum_type } => vec![self.create_enum_sql(enum_type)],
            Operation::AddEnumLabel { name, label, before } => {
                let mut sql = format!(
                    "ALTER TYPE {} ADD VALUE {}",
                    self.qualified(name),
                    quote_literal(label)
                );
                if let Some(before) = before {
                    sql.push_str(&format!(" BEFORE {}", quote_literal(before)));
                }
                vec![sql]
            }
            Operation::RecreateEnum { after, dependents } => self.recreate_enum_sql(after, dependents),
            Operation::DropEnum { name } => vec![format!("DROP TYPE {}", self.qualified(name))],
            Operation::CreateTable { table } => vec![self.create_table_sql(table)],
            Operation::DropTable { name } => vec![format!("DROP TABLE {}", self.qualified(name))],
            Operation::RenameTable { from, to } => vec![format!(
                "ALTER TABLE {} RENAME TO {}",
                self.qualified(from),
                quote_ident(to)
            )],
            Operation::AddColumn { table, column } => vec![format!(
                "ALTER TABLE {} ADD COLUMN {}",
                self.qualified(table),
                self.column_definition(column)
            )],
            Operation::DropColumn { table, column } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                self.qualified(table),
                quote_ident(column)
            )],
            Operation::RenameColumn { table, from, to } => vec![format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                self.qualified(table),
                quote_ident(from),
                quote_ident(to)
            )],
            Operation::AlterColumn { table, before, after } => self.alter_column_sql(table, before, after),
            Operation::CreateIndex { table, index } => vec![self.create_index_sql(table, index)],
            Operation::DropIndex { name } => vec![format!("DROP INDEX {}", self.qualified(name))],
            Operation::AddConstraint { table, constraint } => vec![format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                self.qualified(table),
                quote_ident(&constraint.name),
                self.constraint_body(constraint)
            )],
            Operation::DropConstraint { table, name } => vec![format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                self.qualified(table),
                quote_ident(name)
            )],
            Operation::RenameConstraint { table, from, to } => vec![format!(
                "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
                self.qualified(table),
                quote_ident(from),
                quote_ident(to)
            )],
        }
    }

    fn is_transactional(&self, op: &Operation) -> bool {
        // ADD VALUE cannot be used in the same transaction that later
        // uses the new label, so it always runs on its own.
        !matches!(op, Operation::AddEnumLabel { .. })
    }
}
