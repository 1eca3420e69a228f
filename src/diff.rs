//! Schema Diff Engine
//!
//! The core comparison engine that detects changes between two schema states.
//! Entities are matched by name, never by position. Renames are only
//! recognised when the target side declares `renamed_from`; shape-alike
//! drop/create pairs stay a drop and a create.

use crate::model::{Column, Constraint, EnumType, Index, LogicalType, Schema, Table};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Type of schema change detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Drop,
    Alter,
}

/// Categories of schema objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Table,
    Column,
    Index,
    Constraint,
    Enum,
}

/// Field-level sub-delta of an altered column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum FieldChange {
    Renamed { from: String, to: String },
    Type { from: LogicalType, to: LogicalType },
    Nullable { from: bool, to: bool },
    Default { from: Option<String>, to: Option<String> },
    Identity { from: bool, to: bool },
    Generated { from: Option<String>, to: Option<String> },
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldChange::Renamed { from, to } => write!(f, "name: {} → {}", from, to),
            FieldChange::Type { from, to } => write!(f, "type: {} → {}", from, to),
            FieldChange::Nullable { from, to } => write!(f, "nullability: {} → {}", from, to),
            FieldChange::Default { from, to } => write!(f, "default: {:?} → {:?}", from, to),
            FieldChange::Identity { from, to } => write!(f, "identity: {} → {}", from, to),
            FieldChange::Generated { from, to } => write!(f, "generated: {:?} → {:?}", from, to),
        }
    }
}

/// Order-sensitive enum label edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "edit", rename_all = "snake_case")]
pub enum EnumEdit {
    /// New label after every existing one
    Append { label: String },
    /// New label placed before an existing one
    InsertBefore { label: String, before: String },
    Remove { label: String },
    /// Same surviving labels, different order
    Reorder { labels: Vec<String> },
}

impl EnumEdit {
    pub fn is_additive(&self) -> bool {
        matches!(self, EnumEdit::Append { .. } | EnumEdit::InsertBefore { .. })
    }
}

/// A single atomic change between two schema states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    CreateEnum { enum_type: EnumType },
    DropEnum { enum_type: EnumType },
    AlterEnum { before: EnumType, after: EnumType, edits: Vec<EnumEdit> },
    CreateTable { table: Table },
    DropTable { table: Table },
    RenameTable { from: String, to: String },
    AddColumn { table: String, column: Column },
    DropColumn { table: String, column: Column },
    AlterColumn { table: String, before: Column, after: Column, fields: Vec<FieldChange> },
    CreateIndex { table: String, index: Index },
    DropIndex { table: String, index: Index },
    AlterIndex { table: String, before: Index, after: Index },
    AddConstraint { table: String, constraint: Constraint },
    DropConstraint { table: String, constraint: Constraint },
    AlterConstraint { table: String, before: Constraint, after: Constraint },
    /// Same constraint, new name (carried across a table rename)
    RenameConstraint { table: String, from: String, to: String },
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::CreateEnum { .. }
            | Change::CreateTable { .. }
            | Change::AddColumn { .. }
            | Change::CreateIndex { .. }
            | Change::AddConstraint { .. } => ChangeKind::Create,
            Change::DropEnum { .. }
            | Change::DropTable { .. }
            | Change::DropColumn { .. }
            | Change::DropIndex { .. }
            | Change::DropConstraint { .. } => ChangeKind::Drop,
            Change::AlterEnum { .. }
            | Change::RenameTable { .. }
            | Change::AlterColumn { .. }
            | Change::AlterIndex { .. }
            | Change::AlterConstraint { .. }
            | Change::RenameConstraint { .. } => ChangeKind::Alter,
        }
    }

    pub fn object_type(&self) -> ObjectType {
        match self {
            Change::CreateEnum { .. } | Change::DropEnum { .. } | Change::AlterEnum { .. } => ObjectType::Enum,
            Change::CreateTable { .. } | Change::DropTable { .. } | Change::RenameTable { .. } => ObjectType::Table,
            Change::AddColumn { .. } | Change::DropColumn { .. } | Change::AlterColumn { .. } => ObjectType::Column,
            Change::CreateIndex { .. } | Change::DropIndex { .. } | Change::AlterIndex { .. } => ObjectType::Index,
            Change::AddConstraint { .. }
            | Change::DropConstraint { .. }
            | Change::AlterConstraint { .. }
            | Change::RenameConstraint { .. } => ObjectType::Constraint,
        }
    }

    /// Table the change lives on (enums have none)
    pub fn table_name(&self) -> Option<&str> {
        match self {
            Change::CreateEnum { .. } | Change::DropEnum { .. } | Change::AlterEnum { .. } => None,
            Change::CreateTable { table } | Change::DropTable { table } => Some(&table.name),
            Change::RenameTable { to, .. } => Some(to),
            Change::AddColumn { table, .. }
            | Change::DropColumn { table, .. }
            | Change::AlterColumn { table, .. }
            | Change::CreateIndex { table, .. }
            | Change::DropIndex { table, .. }
            | Change::AlterIndex { table, .. }
            | Change::AddConstraint { table, .. }
            | Change::DropConstraint { table, .. }
            | Change::AlterConstraint { table, .. }
            | Change::RenameConstraint { table, .. } => Some(table),
        }
    }

    /// Full path to the object (e.g. "users.email")
    pub fn path(&self) -> String {
        match self {
            Change::CreateEnum { enum_type } | Change::DropEnum { enum_type } => enum_type.name.clone(),
            Change::AlterEnum { after, .. } => after.name.clone(),
            Change::CreateTable { table } | Change::DropTable { table } => table.name.clone(),
            Change::RenameTable { to, .. } => to.clone(),
            Change::AddColumn { table, column } | Change::DropColumn { table, column } => {
                format!("{}.{}", table, column.name)
            }
            Change::AlterColumn { table, after, .. } => format!("{}.{}", table, after.name),
            Change::CreateIndex { table, index } | Change::DropIndex { table, index } => {
                format!("{}.{}", table, index.name)
            }
            Change::AlterIndex { table, after, .. } => format!("{}.{}", table, after.name),
            Change::AddConstraint { table, constraint } | Change::DropConstraint { table, constraint } => {
                format!("{}.{}", table, constraint.name)
            }
            Change::AlterConstraint { table, after, .. } => format!("{}.{}", table, after.name),
            Change::RenameConstraint { table, to, .. } => format!("{}.{}", table, to),
        }
    }

    /// Human-readable description
    pub fn description(&self) -> String {
        match self {
            Change::CreateEnum { enum_type } => {
                format!("Create enum {} ({})", enum_type.name, enum_type.labels.join(", "))
            }
            Change::DropEnum { enum_type } => format!("Drop enum {}", enum_type.name),
            Change::AlterEnum { after, edits, .. } => {
                let edits: Vec<String> = edits
                    .iter()
                    .map(|e| match e {
                        EnumEdit::Append { label } => format!("append '{}'", label),
                        EnumEdit::InsertBefore { label, before } => format!("insert '{}' before '{}'", label, before),
                        EnumEdit::Remove { label } => format!("remove '{}'", label),
                        EnumEdit::Reorder { .. } => "reorder labels".to_string(),
                    })
                    .collect();
                format!("Alter enum {}: {}", after.name, edits.join(", "))
            }
            Change::CreateTable { table } => {
                format!("Create table {} with {} columns", table.name, table.columns.len())
            }
            Change::DropTable { table } => {
                format!("Drop table {} ({} columns, all data lost)", table.name, table.columns.len())
            }
            Change::RenameTable { from, to } => format!("Rename table {} to {}", from, to),
            Change::AddColumn { table, column } => format!(
                "Add column {}.{} {} {}",
                table,
                column.name,
                column.logical_type,
                if column.nullable { "nullable" } else { "NOT NULL" }
            ),
            Change::DropColumn { table, column } => {
                format!("Drop column {}.{} (type: {}, data lost)", table, column.name, column.logical_type)
            }
            Change::AlterColumn { table, before, fields, .. } => {
                let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
                format!("Alter column {}.{}: {}", table, before.name, fields.join(", "))
            }
            Change::CreateIndex { table, index } => format!(
                "Create {}index {} on {}",
                if index.unique { "unique " } else { "" },
                index.name,
                table
            ),
            Change::DropIndex { table, index } => format!("Drop index {} from {}", index.name, table),
            Change::AlterIndex { table, after, .. } => format!("Rebuild index {} on {}", after.name, table),
            Change::AddConstraint { table, constraint } => {
                format!("Add {} {} on {}", constraint.kind_label(), constraint.name, table)
            }
            Change::DropConstraint { table, constraint } => {
                format!("Drop {} {} from {}", constraint.kind_label(), constraint.name, table)
            }
            Change::AlterConstraint { table, after, .. } => {
                format!("Replace {} {} on {}", after.kind_label(), after.name, table)
            }
            Change::RenameConstraint { table, from, to } => {
                format!("Rename constraint {} on {} to {}", from, table, to)
            }
        }
    }

    /// Fold this change into `schema`, mirroring what the database does
    /// when the corresponding DDL succeeds.
    pub fn apply_to(&self, schema: &mut Schema) {
        match self {
            Change::CreateEnum { enum_type } => schema.enums.push(enum_type.clone()),
            Change::DropEnum { enum_type } => schema.enums.retain(|e| e.name != enum_type.name),
            Change::AlterEnum { after, .. } => {
                if let Some(e) = schema.enums.iter_mut().find(|e| e.name == after.name) {
                    e.labels = after.labels.clone();
                }
            }
            Change::CreateTable { table } => {
                let mut table = table.clone();
                table.renamed_from = None;
                for column in &mut table.columns {
                    column.renamed_from = None;
                }
                schema.tables.push(table);
            }
            Change::DropTable { table } => schema.tables.retain(|t| t.name != table.name),
            Change::RenameTable { from, to } => {
                if let Some(t) = schema.table_mut(from) {
                    t.name = to.clone();
                }
                for t in &mut schema.tables {
                    for c in &mut t.constraints {
                        if let crate::model::ConstraintKind::ForeignKey(fk) = &mut c.kind {
                            if &fk.referenced_table == from {
                                fk.referenced_table = to.clone();
                            }
                        }
                    }
                }
            }
            Change::AddColumn { table, column } => {
                if let Some(t) = schema.table_mut(table) {
                    let mut column = column.clone();
                    column.renamed_from = None;
                    t.columns.push(column);
                }
            }
            Change::DropColumn { table, column } => {
                if let Some(t) = schema.table_mut(table) {
                    t.columns.retain(|c| c.name != column.name);
                }
            }
            Change::AlterColumn { table, before, after, .. } => {
                if let Some(t) = schema.table_mut(table) {
                    if let Some(c) = t.columns.iter_mut().find(|c| c.name == before.name) {
                        *c = after.clone();
                        c.renamed_from = None;
                    }
                }
                if before.name != after.name {
                    rename_column_references(schema, table, &before.name, &after.name);
                }
            }
            Change::CreateIndex { table, index } => {
                if let Some(t) = schema.table_mut(table) {
                    t.indexes.push(index.clone());
                }
            }
            Change::DropIndex { table, index } => {
                if let Some(t) = schema.table_mut(table) {
                    t.indexes.retain(|i| i.name != index.name);
                }
            }
            Change::AlterIndex { table, before, after } => {
                if let Some(t) = schema.table_mut(table) {
                    t.indexes.retain(|i| i.name != before.name);
                    t.indexes.push(after.clone());
                }
            }
            Change::AddConstraint { table, constraint } => {
                if let Some(t) = schema.table_mut(table) {
                    t.constraints.push(constraint.clone());
                }
            }
            Change::DropConstraint { table, constraint } => {
                if let Some(t) = schema.table_mut(table) {
                    t.constraints.retain(|c| c.name != constraint.name);
                }
            }
            Change::AlterConstraint { table, before, after } => {
                if let Some(t) = schema.table_mut(table) {
                    t.constraints.retain(|c| c.name != before.name);
                    t.constraints.push(after.clone());
                }
            }
            Change::RenameConstraint { table, from, to } => {
                if let Some(c) = schema
                    .table_mut(table)
                    .and_then(|t| t.constraints.iter_mut().find(|c| &c.name == from))
                {
                    c.name = to.clone();
                }
            }
        }
    }
}

/// The database rewrites column references on rename; so do we.
fn rename_column_references(schema: &mut Schema, table: &str, from: &str, to: &str) {
    let swap = |cols: &mut Vec<String>| {
        for c in cols.iter_mut() {
            if c == from {
                *c = to.to_string();
            }
        }
    };

    for t in &mut schema.tables {
        let own = t.name == table;
        for c in &mut t.constraints {
            match &mut c.kind {
                crate::model::ConstraintKind::PrimaryKey { columns }
                | crate::model::ConstraintKind::Unique { columns } if own => swap(columns),
                crate::model::ConstraintKind::ForeignKey(fk) => {
                    if own {
                        swap(&mut fk.columns);
                    }
                    if fk.referenced_table == table {
                        swap(&mut fk.referenced_columns);
                    }
                }
                _ => {}
            }
        }
        if own {
            for i in &mut t.indexes {
                swap(&mut i.columns);
            }
        }
    }
}

/// Summary statistics for the delta
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub tables_created: usize,
    pub tables_dropped: usize,
    pub tables_altered: usize,
    pub columns_added: usize,
    pub columns_dropped: usize,
    pub columns_altered: usize,
    pub indexes_changed: usize,
    pub constraints_changed: usize,
    pub enums_changed: usize,
    pub total_changes: usize,
}

/// Ordered structural delta between two schemas
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub changes: Vec<Change>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn summary(&self) -> DiffSummary {
        let mut summary = DiffSummary {
            total_changes: self.changes.len(),
            ..Default::default()
        };
        let mut altered_tables: HashSet<&str> = HashSet::new();

        for change in &self.changes {
            match (change.object_type(), change.kind()) {
                (ObjectType::Table, ChangeKind::Create) => summary.tables_created += 1,
                (ObjectType::Table, ChangeKind::Drop) => summary.tables_dropped += 1,
                (ObjectType::Column, kind) => {
                    match kind {
                        ChangeKind::Create => summary.columns_added += 1,
                        ChangeKind::Drop => summary.columns_dropped += 1,
                        ChangeKind::Alter => summary.columns_altered += 1,
                    }
                    if let Some(table) = change.table_name() {
                        altered_tables.insert(table);
                    }
                }
                (ObjectType::Index, _) => summary.indexes_changed += 1,
                (ObjectType::Constraint, _) => summary.constraints_changed += 1,
                (ObjectType::Enum, _) => summary.enums_changed += 1,
                (ObjectType::Table, ChangeKind::Alter) => {
                    if let Some(table) = change.table_name() {
                        altered_tables.insert(table);
                    }
                }
            }
        }

        summary.tables_altered = altered_tables.len();
        summary
    }
}

/// The diff engine that compares schema states
pub struct DiffEngine;

impl DiffEngine {
    /// Compare `before` against `after` and return every structural change
    pub fn diff(before: &Schema, after: &Schema) -> Delta {
        let before = before.clone().normalized();
        let after = after.clone().normalized();
        let mut changes = Vec::new();

        Self::diff_enums(&before.enums, &after.enums, &mut changes);
        Self::diff_tables(&before.tables, &after.tables, &mut changes);

        Delta { changes }
    }

    fn diff_enums(before: &[EnumType], after: &[EnumType], changes: &mut Vec<Change>) {
        let before_map: HashMap<&str, &EnumType> = before.iter().map(|e| (e.name.as_str(), e)).collect();
        let after_map: HashMap<&str, &EnumType> = after.iter().map(|e| (e.name.as_str(), e)).collect();

        for e in after {
            match before_map.get(e.name.as_str()) {
                None => changes.push(Change::CreateEnum { enum_type: e.clone() }),
                Some(old) if old.labels != e.labels => changes.push(Change::AlterEnum {
                    before: (*old).clone(),
                    after: e.clone(),
                    edits: Self::enum_edits(&old.labels, &e.labels),
                }),
                Some(_) => {}
            }
        }

        for e in before {
            if !after_map.contains_key(e.name.as_str()) {
                changes.push(Change::DropEnum { enum_type: e.clone() });
            }
        }
    }

    /// Position-aware label edits turning `before` into `after`
    pub fn enum_edits(before: &[String], after: &[String]) -> Vec<EnumEdit> {
        let mut edits = Vec::new();

        for label in before.iter().filter(|l| !after.contains(l)) {
            edits.push(EnumEdit::Remove { label: label.clone() });
        }

        let kept_before: Vec<&String> = before.iter().filter(|l| after.contains(l)).collect();
        let kept_after: Vec<&String> = after.iter().filter(|l| before.contains(l)).collect();
        if kept_before != kept_after {
            edits.push(EnumEdit::Reorder { labels: after.to_vec() });
        }

        for (i, label) in after.iter().enumerate() {
            if before.contains(label) {
                continue;
            }
            match after[i + 1..].iter().find(|l| before.contains(l)) {
                Some(next) => edits.push(EnumEdit::InsertBefore {
                    label: label.clone(),
                    before: next.clone(),
                }),
                None => edits.push(EnumEdit::Append { label: label.clone() }),
            }
        }

        edits
    }

    fn diff_tables(before: &[Table], after: &[Table], changes: &mut Vec<Change>) {
        let before_map: HashMap<&str, &Table> = before.iter().map(|t| (t.name.as_str(), t)).collect();
        let after_map: HashMap<&str, &Table> = after.iter().map(|t| (t.name.as_str(), t)).collect();

        // Declared renames: old name must exist before and be gone after
        let mut renamed_sources: HashSet<&str> = HashSet::new();
        let mut pairs: Vec<(&Table, &Table)> = Vec::new();
        let mut created: Vec<&Table> = Vec::new();

        for table in after {
            if let Some(old) = before_map.get(table.name.as_str()).copied() {
                pairs.push((old, table));
                continue;
            }
            let rename_source = table.renamed_from.as_deref().and_then(|old| {
                (!after_map.contains_key(old) && !renamed_sources.contains(old))
                    .then(|| before_map.get(old).copied())
                    .flatten()
            });
            match rename_source {
                Some(old) => {
                    renamed_sources.insert(old.name.as_str());
                    changes.push(Change::RenameTable {
                        from: old.name.clone(),
                        to: table.name.clone(),
                    });
                    pairs.push((old, table));
                }
                None => created.push(table),
            }
        }

        for table in created {
            changes.push(Change::CreateTable { table: table.clone() });
        }

        for table in before {
            if !after_map.contains_key(table.name.as_str()) && !renamed_sources.contains(table.name.as_str()) {
                changes.push(Change::DropTable { table: table.clone() });
            }
        }

        for (old, new) in pairs {
            Self::diff_columns(old, new, changes);
            Self::diff_indexes(&new.name, &old.indexes, &new.indexes, changes);
            let renamed_from = (old.name != new.name).then_some(old.name.as_str());
            Self::diff_constraints(&new.name, renamed_from, &old.constraints, &new.constraints, changes);
        }
    }

    fn diff_columns(old: &Table, new: &Table, changes: &mut Vec<Change>) {
        let table = &new.name;
        let mut renamed_sources: HashSet<&str> = HashSet::new();

        for column in &new.columns {
            if let Some(before) = old.column(&column.name) {
                let fields = Self::compare_columns(before, column);
                if !fields.is_empty() {
                    changes.push(Change::AlterColumn {
                        table: table.clone(),
                        before: before.clone(),
                        after: column.clone(),
                        fields,
                    });
                }
                continue;
            }

            let rename_source = column.renamed_from.as_deref().and_then(|from| {
                (new.column(from).is_none() && !renamed_sources.contains(from))
                    .then(|| old.column(from))
                    .flatten()
            });
            match rename_source {
                Some(before) => {
                    renamed_sources.insert(before.name.as_str());
                    let mut fields = vec![FieldChange::Renamed {
                        from: before.name.clone(),
                        to: column.name.clone(),
                    }];
                    fields.extend(Self::compare_columns(before, column));
                    changes.push(Change::AlterColumn {
                        table: table.clone(),
                        before: before.clone(),
                        after: column.clone(),
                        fields,
                    });
                }
                None => changes.push(Change::AddColumn {
                    table: table.clone(),
                    column: column.clone(),
                }),
            }
        }

        for column in &old.columns {
            if new.column(&column.name).is_none() && !renamed_sources.contains(column.name.as_str()) {
                changes.push(Change::DropColumn {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
        }
    }

    fn compare_columns(from: &Column, to: &Column) -> Vec<FieldChange> {
        let mut fields = Vec::new();

        if from.logical_type != to.logical_type {
            fields.push(FieldChange::Type {
                from: from.logical_type.clone(),
                to: to.logical_type.clone(),
            });
        }
        if from.nullable != to.nullable {
            fields.push(FieldChange::Nullable { from: from.nullable, to: to.nullable });
        }
        if from.default != to.default {
            fields.push(FieldChange::Default {
                from: from.default.clone(),
                to: to.default.clone(),
            });
        }
        if from.identity != to.identity {
            fields.push(FieldChange::Identity { from: from.identity, to: to.identity });
        }
        if from.generated != to.generated {
            fields.push(FieldChange::Generated {
                from: from.generated.clone(),
                to: to.generated.clone(),
            });
        }

        fields
    }

    fn diff_indexes(table: &str, before: &[Index], after: &[Index], changes: &mut Vec<Change>) {
        for index in after {
            match before.iter().find(|i| i.name == index.name) {
                None => changes.push(Change::CreateIndex {
                    table: table.to_string(),
                    index: index.clone(),
                }),
                Some(old) if old != index => changes.push(Change::AlterIndex {
                    table: table.to_string(),
                    before: old.clone(),
                    after: index.clone(),
                }),
                Some(_) => {}
            }
        }
        for index in before {
            if !after.iter().any(|i| i.name == index.name) {
                changes.push(Change::DropIndex {
                    table: table.to_string(),
                    index: index.clone(),
                });
            }
        }
    }

    fn diff_constraints(
        table: &str,
        renamed_from: Option<&str>,
        before: &[Constraint],
        after: &[Constraint],
        changes: &mut Vec<Change>,
    ) {
        // after name -> before name
        let carried = renamed_from
            .map(|old_table| Self::carried_constraint_names(old_table, table, before, after))
            .unwrap_or_default();
        for (to, from) in &carried {
            changes.push(Change::RenameConstraint {
                table: table.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        for constraint in after.iter().filter(|c| !carried.contains_key(c.name.as_str())) {
            match before.iter().find(|c| c.name == constraint.name) {
                None => changes.push(Change::AddConstraint {
                    table: table.to_string(),
                    constraint: constraint.clone(),
                }),
                Some(old) if old != constraint => changes.push(Change::AlterConstraint {
                    table: table.to_string(),
                    before: old.clone(),
                    after: constraint.clone(),
                }),
                Some(_) => {}
            }
        }
        let carried_sources: HashSet<&str> = carried.values().copied().collect();
        for constraint in before.iter().filter(|c| !carried_sources.contains(c.name.as_str())) {
            if !after.iter().any(|c| c.name == constraint.name) {
                changes.push(Change::DropConstraint {
                    table: table.to_string(),
                    constraint: constraint.clone(),
                });
            }
        }
    }

    /// Constraints of a renamed table that only differ by the table-name
    /// prefix of their name (`users_pkey` → `members_pkey`)
    fn carried_constraint_names<'a>(
        old_table: &str,
        new_table: &str,
        before: &'a [Constraint],
        after: &'a [Constraint],
    ) -> BTreeMap<&'a str, &'a str> {
        let mut carried = BTreeMap::new();
        let mut used: HashSet<&str> = HashSet::new();

        for constraint in after {
            if before.iter().any(|c| c.name == constraint.name) {
                continue;
            }
            let Some(wanted) = name_suffix(&constraint.name, new_table) else {
                continue;
            };
            let source = before.iter().find(|c| {
                c.kind == constraint.kind
                    && !used.contains(c.name.as_str())
                    && !after.iter().any(|a| a.name == c.name)
                    && name_suffix(&c.name, old_table) == Some(wanted)
            });
            if let Some(source) = source {
                used.insert(source.name.as_str());
                carried.insert(constraint.name.as_str(), source.name.as_str());
            }
        }
        carried
    }
}

/// `users_pkey` with table `users` → `pkey`
fn name_suffix<'n>(name: &'n str, table: &str) -> Option<&'n str> {
    name.strip_prefix(table).and_then(|rest| rest.strip_prefix('_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Constraint, LogicalType};
    use pretty_assertions::assert_eq;

    fn users(extra: Option<Column>) -> Table {
        let mut t = Table::new("users")
            .with_column(Column::new("id", LogicalType::Integer))
            .with_constraint(Constraint::primary_key(&["id"]));
        if let Some(c) = extra {
            t = t.with_column(c);
        }
        t
    }

    #[test]
    fn test_self_diff_is_empty() {
        let schema = Schema::new("public")
            .with_enum(EnumType::new("mood", &["sad", "ok"]))
            .with_table(users(Some(Column::new("email", LogicalType::text()))));
        assert!(DiffEngine::diff(&schema, &schema).is_empty());
    }

    #[test]
    fn test_added_column_is_single_change() {
        let before = Schema::new("public").with_table(users(None));
        let after = Schema::new("public").with_table(users(Some(Column::new("email", LogicalType::text()))));

        let delta = DiffEngine::diff(&before, &after);
        assert_eq!(delta.len(), 1);
        assert_eq!(
            delta.changes[0],
            Change::AddColumn {
                table: "users".into(),
                column: Column::new("email", LogicalType::text()),
            }
        );
        assert_eq!(delta.changes[0].kind(), ChangeKind::Create);
        assert_eq!(delta.changes[0].path(), "users.email");
    }

    #[test]
    fn test_nullability_sub_delta() {
        let before = Schema::new("public").with_table(users(Some(Column::new("email", LogicalType::text()).not_null())));
        let after = Schema::new("public").with_table(users(Some(Column::new("email", LogicalType::text()))));

        let delta = DiffEngine::diff(&before, &after);
        match &delta.changes[0] {
            Change::AlterColumn { fields, .. } => {
                assert_eq!(fields, &vec![FieldChange::Nullable { from: false, to: true }]);
                assert_eq!(fields[0].to_string(), "nullability: false → true");
            }
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn test_rename_without_alias_is_drop_and_create() {
        let before = Schema::new("public").with_table(users(Some(Column::new("mail", LogicalType::text()))));
        let after = Schema::new("public").with_table(users(Some(Column::new("email", LogicalType::text()))));

        let kinds: Vec<ChangeKind> = DiffEngine::diff(&before, &after).iter().map(|c| c.kind()).collect();
        assert_eq!(kinds, vec![ChangeKind::Create, ChangeKind::Drop]);
    }

    #[test]
    fn test_rename_with_alias_is_alter() {
        let before = Schema::new("public").with_table(users(Some(Column::new("mail", LogicalType::text()))));
        let after = Schema::new("public").with_table(users(Some(
            Column::new("email", LogicalType::text()).renamed_from("mail"),
        )));

        let delta = DiffEngine::diff(&before, &after);
        assert_eq!(delta.len(), 1);
        assert!(matches!(
            &delta.changes[0],
            Change::AlterColumn { fields, .. } if fields == &vec![FieldChange::Renamed { from: "mail".into(), to: "email".into() }]
        ));
    }

    #[test]
    fn test_identical_shape_table_is_not_renamed() {
        let before = Schema::new("public").with_table(users(None));
        let mut people = users(None);
        people.name = "people".into();
        people.constraints[0].name = String::new();
        let after = Schema::new("public").with_table(people);

        let delta = DiffEngine::diff(&before, &after);
        assert!(matches!(delta.changes[0], Change::CreateTable { .. }));
        assert!(matches!(delta.changes[1], Change::DropTable { .. }));
    }

    #[test]
    fn test_table_alias_rename() {
        let before = Schema::new("public").with_table(users(None));
        let mut people = users(None).renamed_from("users");
        people.name = "people".into();
        people.constraints[0].name = "users_pkey".into();
        let after = Schema::new("public").with_table(people);

        let delta = DiffEngine::diff(&before, &after);
        assert_eq!(
            delta.changes,
            vec![Change::RenameTable { from: "users".into(), to: "people".into() }]
        );
    }

    #[test]
    fn test_table_rename_carries_default_constraint_names() {
        let before = Schema::new("public").with_table(users(None));
        let mut people = users(None).renamed_from("users");
        people.name = "people".into();
        let after = Schema::new("public").with_table(people);

        let delta = DiffEngine::diff(&before, &after);
        assert_eq!(
            delta.changes,
            vec![
                Change::RenameTable { from: "users".into(), to: "people".into() },
                Change::RenameConstraint {
                    table: "people".into(),
                    from: "users_pkey".into(),
                    to: "people_pkey".into(),
                },
            ]
        );

        let mut folded = before.clone().normalized();
        for change in delta.iter() {
            change.apply_to(&mut folded);
        }
        assert!(DiffEngine::diff(&folded, &after).is_empty());
    }

    #[test]
    fn test_check_parentheses_do_not_count_as_a_change() {
        let priced = |expr: &str| {
            Schema::new("public").with_table(
                Table::new("p")
                    .with_column(Column::new("price", LogicalType::Integer))
                    .with_constraint(Constraint::check(expr)),
            )
        };
        assert!(DiffEngine::diff(&priced("(price > 0)"), &priced("price > 0")).is_empty());
        assert_eq!(DiffEngine::diff(&priced("(price > 0)"), &priced("price >= 0")).len(), 1);
    }

    #[test]
    fn test_enum_edits_are_position_aware() {
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();

        assert_eq!(
            DiffEngine::enum_edits(&s(&["a", "b"]), &s(&["a", "b", "c"])),
            vec![EnumEdit::Append { label: "c".into() }]
        );
        assert_eq!(
            DiffEngine::enum_edits(&s(&["a", "b"]), &s(&["a", "x", "b"])),
            vec![EnumEdit::InsertBefore { label: "x".into(), before: "b".into() }]
        );
        assert_eq!(
            DiffEngine::enum_edits(&s(&["a", "b", "c"]), &s(&["a", "c"])),
            vec![EnumEdit::Remove { label: "b".into() }]
        );
        assert_eq!(
            DiffEngine::enum_edits(&s(&["a", "b"]), &s(&["b", "a"])),
            vec![EnumEdit::Reorder { labels: s(&["b", "a"]) }]
        );
    }

    #[test]
    fn test_apply_folds_delta_into_before() {
        let before = Schema::new("public")
            .with_enum(EnumType::new("mood", &["sad"]))
            .with_table(users(Some(Column::new("mail", LogicalType::varchar(50)))));
        let after = Schema::new("public")
            .with_enum(EnumType::new("mood", &["sad", "happy"]))
            .with_table(users(Some(Column::new("email", LogicalType::text()).renamed_from("mail"))))
            .with_table(
                Table::new("posts")
                    .with_column(Column::new("id", LogicalType::BigInt).identity())
                    .with_column(Column::new("author", LogicalType::Integer))
                    .with_constraint(Constraint::foreign_key(&["author"], "users", &["id"])),
            );

        let delta = DiffEngine::diff(&before, &after);
        let mut folded = before.clone().normalized();
        for change in delta.iter() {
            change.apply_to(&mut folded);
        }
        assert_eq!(folded.normalized(), after.normalized());
    }

    #[test]
    fn test_summary_counts() {
        let before = Schema::new("public").with_table(users(None));
        let after = Schema::new("public")
            .with_table(users(Some(Column::new("email", LogicalType::text()))))
            .with_table(Table::new("audit").with_column(Column::new("at", LogicalType::Date)));

        let summary = DiffEngine::diff(&before, &after).summary();
        assert_eq!(summary.tables_created, 1);
        assert_eq!(summary.columns_added, 1);
        assert_eq!(summary.tables_altered, 1);
        assert_eq!(summary.total_changes, 2);
    }
}
