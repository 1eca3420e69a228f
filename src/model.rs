//! Schema Model
//!
//! Dialect-independent representation of a relational schema.
//! Both the declared (authored) schema and the introspected live schema
//! are expressed with these types, so the differ only ever compares
//! like with like.

use crate::error::{invalid_schema, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// PostgreSQL truncates identifiers to NAMEDATALEN - 1 bytes
const MAX_IDENTIFIER_LEN: usize = 63;

// =============================================================================
// TYPES
// =============================================================================

/// Logical column type, mapped from the dialect-specific type name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogicalType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Numeric {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        precision: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scale: Option<u32>,
    },
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<u32>,
    },
    Char {
        length: u32,
    },
    Bytes,
    Uuid,
    Json,
    Jsonb,
    Date,
    Time,
    Timestamp {
        #[serde(default)]
        with_time_zone: bool,
    },
    Interval,
    Enum {
        name: String,
    },
    Array {
        element: Box<LogicalType>,
    },
    /// Opaque dialect type we have no mapping for; diffed by its text
    Raw {
        sql: String,
    },
}

/// How a type change relates the old value domain to the new one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeChange {
    Same,
    Widening,
    Narrowing,
    /// Not comparable (different families, opaque types)
    Incompatible,
}

impl LogicalType {
    pub fn text() -> Self {
        LogicalType::Text { max_length: None }
    }

    pub fn varchar(n: u32) -> Self {
        LogicalType::Text { max_length: Some(n) }
    }

    pub fn enumeration(name: impl Into<String>) -> Self {
        LogicalType::Enum { name: name.into() }
    }

    /// Name of the enum this type depends on, looking through arrays
    pub fn enum_name(&self) -> Option<&str> {
        match self {
            LogicalType::Enum { name } => Some(name),
            LogicalType::Array { element } => element.enum_name(),
            _ => None,
        }
    }

    fn int_rank(&self) -> Option<u8> {
        match self {
            LogicalType::SmallInt => Some(1),
            LogicalType::Integer => Some(2),
            LogicalType::BigInt => Some(3),
            _ => None,
        }
    }

    /// Classify a change from `self` to `to`
    pub fn change_to(&self, to: &LogicalType) -> TypeChange {
        use LogicalType::*;

        if self == to {
            return TypeChange::Same;
        }

        if let (Some(a), Some(b)) = (self.int_rank(), to.int_rank()) {
            return if b > a { TypeChange::Widening } else { TypeChange::Narrowing };
        }

        match (self, to) {
            (Real, Double) => TypeChange::Widening,
            (Double, Real) => TypeChange::Narrowing,
            (Text { max_length: a }, Text { max_length: b }) => length_change(*a, *b),
            (Char { length }, Text { max_length }) => length_change(Some(*length), *max_length),
            (Text { .. }, Char { .. }) => TypeChange::Narrowing,
            (Char { length: a }, Char { length: b }) => length_change(Some(*a), Some(*b)),
            (
                Numeric { precision: p1, scale: s1 },
                Numeric { precision: p2, scale: s2 },
            ) => numeric_change(*p1, *s1, *p2, *s2),
            (SmallInt | Integer | BigInt, Numeric { precision: None, .. }) => TypeChange::Widening,
            (Numeric { .. }, SmallInt | Integer | BigInt) => TypeChange::Narrowing,
            (Enum { .. }, Text { max_length: None }) => TypeChange::Widening,
            (Array { element: a }, Array { element: b }) => a.change_to(b),
            _ => TypeChange::Incompatible,
        }
    }
}

fn length_change(from: Option<u32>, to: Option<u32>) -> TypeChange {
    match (from, to) {
        (_, None) => TypeChange::Widening,
        (None, Some(_)) => TypeChange::Narrowing,
        (Some(a), Some(b)) if b >= a => TypeChange::Widening,
        _ => TypeChange::Narrowing,
    }
}

fn numeric_change(p1: Option<u32>, s1: Option<u32>, p2: Option<u32>, s2: Option<u32>) -> TypeChange {
    match (p1, p2) {
        (_, None) => TypeChange::Widening,
        (None, Some(_)) => TypeChange::Narrowing,
        (Some(p1), Some(p2)) => {
            let (s1, s2) = (s1.unwrap_or(0), s2.unwrap_or(0));
            // Scale may exceed precision, so digits left of the point can be negative
            let integer_digits = |p: u32, s: u32| i64::from(p) - i64::from(s);
            if p2 >= p1 && s2 >= s1 && integer_digits(p2, s2) >= integer_digits(p1, s1) {
                TypeChange::Widening
            } else {
                TypeChange::Narrowing
            }
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalType::Boolean => write!(f, "boolean"),
            LogicalType::SmallInt => write!(f, "smallint"),
            LogicalType::Integer => write!(f, "integer"),
            LogicalType::BigInt => write!(f, "bigint"),
            LogicalType::Real => write!(f, "real"),
            LogicalType::Double => write!(f, "double"),
            LogicalType::Numeric { precision: Some(p), scale: Some(s) } => write!(f, "numeric({},{})", p, s),
            LogicalType::Numeric { precision: Some(p), scale: None } => write!(f, "numeric({})", p),
            LogicalType::Numeric { .. } => write!(f, "numeric"),
            LogicalType::Text { max_length: Some(n) } => write!(f, "text({})", n),
            LogicalType::Text { max_length: None } => write!(f, "text"),
            LogicalType::Char { length } => write!(f, "char({})", length),
            LogicalType::Bytes => write!(f, "bytes"),
            LogicalType::Uuid => write!(f, "uuid"),
            LogicalType::Json => write!(f, "json"),
            LogicalType::Jsonb => write!(f, "jsonb"),
            LogicalType::Date => write!(f, "date"),
            LogicalType::Time => write!(f, "time"),
            LogicalType::Timestamp { with_time_zone: true } => write!(f, "timestamptz"),
            LogicalType::Timestamp { with_time_zone: false } => write!(f, "timestamp"),
            LogicalType::Interval => write!(f, "interval"),
            LogicalType::Enum { name } => write!(f, "enum {}", name),
            LogicalType::Array { element } => write!(f, "{}[]", element),
            LogicalType::Raw { sql } => write!(f, "raw({})", sql),
        }
    }
}

// =============================================================================
// ENTITIES
// =============================================================================

/// Column representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Identity column (`GENERATED BY DEFAULT AS IDENTITY`)
    #[serde(default)]
    pub identity: bool,
    /// Stored generated column expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<String>,
    /// Declared rename intent; never inferred
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            nullable: true,
            default: None,
            identity: false,
            generated: None,
            renamed_from: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    pub fn identity(mut self) -> Self {
        self.identity = true;
        self.nullable = false;
        self
    }

    pub fn generated(mut self, expr: impl Into<String>) -> Self {
        self.generated = Some(expr.into());
        self
    }

    pub fn renamed_from(mut self, old: impl Into<String>) -> Self {
        self.renamed_from = Some(old.into());
        self
    }

    /// Attribute equality, ignoring the name and rename metadata
    pub fn same_shape(&self, other: &Column) -> bool {
        self.logical_type == other.logical_type
            && self.nullable == other.nullable
            && self.default == other.default
            && self.identity == other.identity
            && self.generated == other.generated
    }

    /// Whether the database fills this column without an explicit value
    pub fn has_value_source(&self) -> bool {
        self.default.is_some() || self.identity || self.generated.is_some()
    }
}

/// Index representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    /// Expression key (e.g. `lower(email)`), used instead of columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Partial index predicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
}

impl Index {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
            expression: None,
            predicate: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

}

/// Foreign key referential action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }

    /// Decode `pg_constraint.confupdtype` / `confdeltype`
    pub fn from_pg_code(code: &str) -> Self {
        match code {
            "r" => ReferentialAction::Restrict,
            "c" => ReferentialAction::Cascade,
            "n" => ReferentialAction::SetNull,
            "d" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }
}

/// Foreign key relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    #[serde(default)]
    pub on_delete: ReferentialAction,
    #[serde(default)]
    pub on_update: ReferentialAction,
    #[serde(default)]
    pub deferrable: bool,
}

/// Constraint kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey { columns: Vec<String> },
    ForeignKey(ForeignKey),
    Unique { columns: Vec<String> },
    Check { expression: String },
}

/// Table-level constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: ConstraintKind,
}

impl Constraint {
    pub fn primary_key(columns: &[&str]) -> Self {
        Self::unnamed(ConstraintKind::PrimaryKey { columns: to_strings(columns) })
    }

    pub fn unique(columns: &[&str]) -> Self {
        Self::unnamed(ConstraintKind::Unique { columns: to_strings(columns) })
    }

    pub fn check(expression: impl Into<String>) -> Self {
        Self::unnamed(ConstraintKind::Check { expression: expression.into() })
    }

    pub fn foreign_key(columns: &[&str], referenced_table: &str, referenced_columns: &[&str]) -> Self {
        Self::unnamed(ConstraintKind::ForeignKey(ForeignKey {
            columns: to_strings(columns),
            referenced_table: referenced_table.to_string(),
            referenced_columns: to_strings(referenced_columns),
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
            deferrable: false,
        }))
    }

    fn unnamed(kind: ConstraintKind) -> Self {
        Self { name: String::new(), kind }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        if let ConstraintKind::ForeignKey(fk) = &mut self.kind {
            fk.on_delete = action;
        }
        self
    }

    pub fn deferrable(mut self) -> Self {
        if let ConstraintKind::ForeignKey(fk) = &mut self.kind {
            fk.deferrable = true;
        }
        self
    }

    pub fn as_foreign_key(&self) -> Option<&ForeignKey> {
        match &self.kind {
            ConstraintKind::ForeignKey(fk) => Some(fk),
            _ => None,
        }
    }

    /// Local columns the constraint covers (empty for checks)
    pub fn columns(&self) -> &[String] {
        match &self.kind {
            ConstraintKind::PrimaryKey { columns } | ConstraintKind::Unique { columns } => columns,
            ConstraintKind::ForeignKey(fk) => &fk.columns,
            ConstraintKind::Check { .. } => &[],
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            ConstraintKind::PrimaryKey { .. } => "primary key",
            ConstraintKind::ForeignKey(_) => "foreign key",
            ConstraintKind::Unique { .. } => "unique constraint",
            ConstraintKind::Check { .. } => "check constraint",
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Enumerated type; label order is significant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumType {
    pub name: String,
    pub labels: Vec<String>,
}

impl EnumType {
    pub fn new(name: impl Into<String>, labels: &[&str]) -> Self {
        Self {
            name: name.into(),
            labels: to_strings(labels),
        }
    }
}

/// Table representation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub indexes: Vec<Index>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Declared rename intent; never inferred
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            constraints: Vec::new(),
            renamed_from: None,
        }
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn renamed_from(mut self, old: impl Into<String>) -> Self {
        self.renamed_from = Some(old.into());
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn constraint(&self, name: &str) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn primary_key(&self) -> Option<&Constraint> {
        self.constraints
            .iter()
            .find(|c| matches!(c.kind, ConstraintKind::PrimaryKey { .. }))
    }

    pub fn foreign_keys(&self) -> impl Iterator<Item = (&Constraint, &ForeignKey)> {
        self.constraints
            .iter()
            .filter_map(|c| c.as_foreign_key().map(|fk| (c, fk)))
    }

    /// Fill PostgreSQL-convention names for unnamed constraints and indexes
    fn assign_default_names(&mut self, taken: &mut HashSet<String>) {
        for constraint in &mut self.constraints {
            if !constraint.name.is_empty() {
                continue;
            }
            let base = match &constraint.kind {
                ConstraintKind::PrimaryKey { .. } => format!("{}_pkey", self.name),
                ConstraintKind::ForeignKey(fk) => format!("{}_{}_fkey", self.name, fk.columns.join("_")),
                ConstraintKind::Unique { columns } => format!("{}_{}_key", self.name, columns.join("_")),
                ConstraintKind::Check { .. } => format!("{}_check", self.name),
            };
            constraint.name = unique_name(base, taken);
        }
        for index in &mut self.indexes {
            if !index.name.is_empty() {
                continue;
            }
            let key = if index.expression.is_some() {
                "expr".to_string()
            } else {
                index.columns.join("_")
            };
            index.name = unique_name(format!("{}_{}_idx", self.name, key), taken);
        }
    }
}

fn unique_name(base: String, taken: &mut HashSet<String>) -> String {
    let mut candidate = truncate_to(&base, MAX_IDENTIFIER_LEN);
    let mut n = 1;
    while taken.contains(&candidate) {
        // The suffix must survive the server's own truncation
        let suffix = n.to_string();
        candidate = format!("{}{}", truncate_to(&base, MAX_IDENTIFIER_LEN - suffix.len()), suffix);
        n += 1;
    }
    taken.insert(candidate.clone());
    candidate
}

pub(crate) fn truncate_identifier(name: &str) -> String {
    truncate_to(name, MAX_IDENTIFIER_LEN)
}

fn truncate_to(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// `((a > 0))` → `a > 0`; `(a) OR (b)` is left alone
pub(crate) fn strip_outer_parens(expr: &str) -> String {
    let mut expr = expr.trim();
    while expr.starts_with('(') && expr.ends_with(')') && closes_at_end(expr) {
        expr = expr[1..expr.len() - 1].trim();
    }
    expr.to_string()
}

/// Whether the opening paren at 0 is matched by the final character
fn closes_at_end(expr: &str) -> bool {
    let mut depth = 0usize;
    let mut quoted = false;
    for (i, ch) in expr.char_indices() {
        match ch {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i == expr.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}

/// Structural equality: column order is display-only and rename intent
/// is not part of the structure.
impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        if self.name != other.name
            || self.columns.len() != other.columns.len()
            || self.indexes.len() != other.indexes.len()
            || self.constraints.len() != other.constraints.len()
        {
            return false;
        }
        self.columns.iter().all(|c| {
            other
                .column(&c.name)
                .is_some_and(|o| c.same_shape(o))
        }) && self.indexes.iter().all(|i| other.index(&i.name) == Some(i))
            && self
                .constraints
                .iter()
                .all(|c| other.constraint(&c.name) == Some(c))
    }
}

impl Eq for Table {}

// =============================================================================
// SCHEMA
// =============================================================================

/// Complete schema: tables and enums under one namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub enums: Vec<EnumType>,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.tables.len() == other.tables.len()
            && self.enums.len() == other.enums.len()
            && self.tables.iter().all(|t| other.table(&t.name) == Some(t))
            && self.enums.iter().all(|e| other.enum_type(&e.name) == Some(e))
    }
}

impl Eq for Schema {}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Vec::new(),
            enums: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_enum(mut self, enum_type: EnumType) -> Self {
        self.enums.push(enum_type);
        self
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    pub fn enum_type(&self, name: &str) -> Option<&EnumType> {
        self.enums.iter().find(|e| e.name == name)
    }

    /// Canonicalize everything whose order or spelling carries no meaning
    pub fn normalize(&mut self) {
        let mut taken: HashSet<String> = self
            .tables
            .iter()
            .flat_map(|t| {
                t.constraints
                    .iter()
                    .map(|c| c.name.clone())
                    .chain(t.indexes.iter().map(|i| i.name.clone()))
            })
            .filter(|n| !n.is_empty())
            .collect();

        self.tables.sort_by(|a, b| a.name.cmp(&b.name));
        for table in &mut self.tables {
            table.assign_default_names(&mut taken);

            let pk_columns: Vec<String> = table
                .primary_key()
                .map(|pk| pk.columns().to_vec())
                .unwrap_or_default();
            for column in &mut table.columns {
                if pk_columns.contains(&column.name) || column.identity {
                    column.nullable = false;
                }
                if column.identity {
                    column.default = None;
                }
                if let Some(default) = &column.default {
                    column.default = Some(default.trim().to_string());
                }
            }

            for constraint in &mut table.constraints {
                if let ConstraintKind::Check { expression } = &mut constraint.kind {
                    *expression = strip_outer_parens(expression);
                }
            }

            table.indexes.sort_by(|a, b| a.name.cmp(&b.name));
            table.constraints.sort_by(|a, b| a.name.cmp(&b.name));
        }
        self.enums.sort_by(|a, b| a.name.cmp(&b.name));
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Check internal consistency; names the offending entity on failure
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid_schema("schema", "schema name is empty"));
        }

        let mut enum_names = HashSet::new();
        for e in &self.enums {
            if !enum_names.insert(e.name.as_str()) {
                return Err(invalid_schema(format!("enum {}", e.name), "duplicate enum name"));
            }
            let mut labels = HashSet::new();
            for label in &e.labels {
                if !labels.insert(label) {
                    return Err(invalid_schema(
                        format!("enum {}", e.name),
                        format!("duplicate label '{}'", label),
                    ));
                }
            }
        }

        let mut tables: HashMap<&str, &Table> = HashMap::new();
        for table in &self.tables {
            if tables.insert(table.name.as_str(), table).is_some() {
                return Err(invalid_schema(format!("table {}", table.name), "duplicate table name"));
            }
        }

        let mut relation_names: HashSet<&str> = HashSet::new();
        for table in &self.tables {
            Self::validate_table(table, &enum_names)?;
            for name in table
                .constraints
                .iter()
                .map(|c| c.name.as_str())
                .chain(table.indexes.iter().map(|i| i.name.as_str()))
                .filter(|n| !n.is_empty())
            {
                if !relation_names.insert(name) {
                    return Err(invalid_schema(
                        format!("{}.{}", table.name, name),
                        "constraint/index name is already used in this schema",
                    ));
                }
            }

            for (constraint, fk) in table.foreign_keys() {
                let entity = format!("{}.{}", table.name, constraint.name);
                let target = tables.get(fk.referenced_table.as_str()).ok_or_else(|| {
                    invalid_schema(
                        &entity,
                        format!("references non-existent table '{}'", fk.referenced_table),
                    )
                })?;
                if fk.columns.is_empty() || fk.columns.len() != fk.referenced_columns.len() {
                    return Err(invalid_schema(
                        &entity,
                        format!(
                            "{} local column(s) but {} referenced column(s)",
                            fk.columns.len(),
                            fk.referenced_columns.len()
                        ),
                    ));
                }
                if let Some(missing) = fk.referenced_columns.iter().find(|c| target.column(c).is_none()) {
                    return Err(invalid_schema(
                        &entity,
                        format!("references non-existent column '{}.{}'", target.name, missing),
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_table(table: &Table, enum_names: &HashSet<&str>) -> Result<()> {
        let mut columns = HashSet::new();
        for column in &table.columns {
            if !columns.insert(column.name.as_str()) {
                return Err(invalid_schema(
                    format!("{}.{}", table.name, column.name),
                    "duplicate column name",
                ));
            }
            if let Some(enum_name) = column.logical_type.enum_name() {
                if !enum_names.contains(enum_name) {
                    return Err(invalid_schema(
                        format!("{}.{}", table.name, column.name),
                        format!("uses unknown enum type '{}'", enum_name),
                    ));
                }
            }
        }

        let pk_count = table
            .constraints
            .iter()
            .filter(|c| matches!(c.kind, ConstraintKind::PrimaryKey { .. }))
            .count();
        if pk_count > 1 {
            return Err(invalid_schema(
                format!("table {}", table.name),
                "more than one primary key",
            ));
        }

        for constraint in &table.constraints {
            if let Some(missing) = constraint.columns().iter().find(|c| !columns.contains(c.as_str())) {
                return Err(invalid_schema(
                    format!("{}.{}", table.name, constraint.name),
                    format!("{} names unknown column '{}'", constraint.kind_label(), missing),
                ));
            }
        }

        for index in &table.indexes {
            if index.columns.is_empty() && index.expression.is_none() {
                return Err(invalid_schema(
                    format!("{}.{}", table.name, index.name),
                    "index has neither columns nor an expression",
                ));
            }
            if let Some(missing) = index.columns.iter().find(|c| !columns.contains(c.as_str())) {
                return Err(invalid_schema(
                    format!("{}.{}", table.name, index.name),
                    format!("index names unknown column '{}'", missing),
                ));
            }
        }

        Ok(())
    }

    /// Stable content hash of the normalized schema
    pub fn checksum(&self) -> String {
        let canonical = self.clone().normalized();
        let mut hasher = Sha256::new();
        // Serializing plain data structs cannot fail
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn users() -> Table {
        Table::new("users")
            .with_column(Column::new("id", LogicalType::Integer))
            .with_column(Column::new("email", LogicalType::text()))
            .with_constraint(Constraint::primary_key(&["id"]))
    }

    #[test]
    fn test_normalize_assigns_postgres_names() {
        let schema = Schema::new("public")
            .with_table(users())
            .with_table(
                Table::new("posts")
                    .with_column(Column::new("id", LogicalType::Integer))
                    .with_column(Column::new("author_id", LogicalType::Integer))
                    .with_constraint(Constraint::foreign_key(&["author_id"], "users", &["id"]))
                    .with_index(Index::new("", &["author_id"])),
            )
            .normalized();

        let posts = schema.table("posts").unwrap();
        assert_eq!(posts.constraints[0].name, "posts_author_id_fkey");
        assert_eq!(posts.indexes[0].name, "posts_author_id_idx");
        assert_eq!(schema.tables[0].name, "posts");

        let users = schema.table("users").unwrap();
        assert_eq!(users.primary_key().unwrap().name, "users_pkey");
        assert!(!users.column("id").unwrap().nullable);
    }

    #[test]
    fn test_equality_ignores_cosmetic_order() {
        let a = Schema::new("public").with_table(users()).normalized();

        let mut reordered = users();
        reordered.columns.reverse();
        let b = Schema::new("public").with_table(reordered).normalized();

        assert_eq!(a, b);
        assert_eq!(a.checksum(), Schema::new("public").with_table(users()).normalized().checksum());
    }

    #[test]
    fn test_duplicate_table_is_invalid() {
        let schema = Schema::new("public").with_table(users()).with_table(users());
        let err = schema.validate().unwrap_err();
        assert!(matches!(err, crate::error::MigrateError::InvalidSchema { ref entity, .. } if entity == "table users"));
    }

    #[test]
    fn test_fk_to_missing_table_or_column_is_invalid() {
        let orphan = Table::new("posts")
            .with_column(Column::new("author_id", LogicalType::Integer))
            .with_constraint(Constraint::foreign_key(&["author_id"], "authors", &["id"]).named("posts_author_fk"));
        let err = Schema::new("public").with_table(orphan).validate().unwrap_err();
        assert!(err.to_string().contains("non-existent table 'authors'"));

        let bad_column = Table::new("posts")
            .with_column(Column::new("author_id", LogicalType::Integer))
            .with_constraint(Constraint::foreign_key(&["author_id"], "users", &["uid"]).named("posts_author_fk"));
        let err = Schema::new("public")
            .with_table(users())
            .with_table(bad_column)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("users.uid"));
    }

    #[test]
    fn test_unknown_enum_is_invalid() {
        let table = Table::new("t").with_column(Column::new("mood", LogicalType::enumeration("mood")));
        assert!(Schema::new("public").with_table(table).validate().is_err());
    }

    #[test]
    fn test_type_width_classification() {
        assert_eq!(LogicalType::Integer.change_to(&LogicalType::BigInt), TypeChange::Widening);
        assert_eq!(LogicalType::BigInt.change_to(&LogicalType::SmallInt), TypeChange::Narrowing);
        assert_eq!(LogicalType::varchar(50).change_to(&LogicalType::text()), TypeChange::Widening);
        assert_eq!(LogicalType::varchar(255).change_to(&LogicalType::varchar(50)), TypeChange::Narrowing);
        assert_eq!(
            LogicalType::Numeric { precision: Some(10), scale: Some(2) }
                .change_to(&LogicalType::Numeric { precision: Some(12), scale: Some(2) }),
            TypeChange::Widening
        );
        assert_eq!(LogicalType::text().change_to(&LogicalType::Integer), TypeChange::Incompatible);
        assert_eq!(
            LogicalType::Raw { sql: "tsvector".into() }.change_to(&LogicalType::text()),
            TypeChange::Incompatible
        );
    }

    #[test]
    fn test_numeric_scale_above_precision() {
        let numeric = |p: u32, s: u32| LogicalType::Numeric { precision: Some(p), scale: Some(s) };
        assert_eq!(numeric(2, 5).change_to(&numeric(3, 5)), TypeChange::Widening);
        assert_eq!(numeric(3, 5).change_to(&numeric(2, 5)), TypeChange::Narrowing);
        assert_eq!(numeric(2, 5).change_to(&numeric(4, 2)), TypeChange::Narrowing);
        assert_eq!(numeric(4, 2).change_to(&numeric(6, 5)), TypeChange::Narrowing);
    }

    #[test]
    fn test_check_expressions_lose_wrapping_parentheses() {
        assert_eq!(strip_outer_parens("((price > 0))"), "price > 0");
        assert_eq!(strip_outer_parens(" (length(name) > 0) "), "length(name) > 0");
        assert_eq!(strip_outer_parens("(a > 0) AND (b > 0)"), "(a > 0) AND (b > 0)");
        assert_eq!(strip_outer_parens("(kind <> ')')"), "kind <> ')'");

        let schema = Schema::new("public")
            .with_table(
                Table::new("p")
                    .with_column(Column::new("price", LogicalType::Integer))
                    .with_constraint(Constraint::check("(price > 0)")),
            )
            .normalized();
        assert_eq!(
            schema.tables[0].constraints[0].kind,
            ConstraintKind::Check { expression: "price > 0".into() }
        );
    }

    #[test]
    fn test_suffixed_default_names_fit_identifier_limit() {
        let long = "a".repeat(70);
        let mut taken = HashSet::new();
        let first = unique_name(long.clone(), &mut taken);
        let second = unique_name(long, &mut taken);

        assert_eq!(first.len(), MAX_IDENTIFIER_LEN);
        assert_eq!(second.len(), MAX_IDENTIFIER_LEN);
        assert!(second.ends_with('1'));
        assert_ne!(first, second);
    }

    #[test]
    fn test_schema_round_trips_through_json() {
        let schema = Schema::new("public")
            .with_enum(EnumType::new("mood", &["sad", "happy"]))
            .with_table(users().with_column(Column::new("mood", LogicalType::enumeration("mood"))))
            .normalized();
        let json = serde_json::to_string(&schema).unwrap();
        let back: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, back);
    }
}
