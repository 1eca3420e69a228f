//! Migration Planner
//!
//! Turns a [`Delta`] into an ordered, classified [`MigrationPlan`].
//!
//! Phases, in order:
//!
//! 1. drop foreign keys that are removed, replaced, or owned by dropped tables
//! 2. drop other constraints and indexes
//! 3. drop columns
//! 4. drop tables, dependents first
//! 5. create enums, add labels, recreate enums for removals/reorders
//! 6. rename tables, then constraints named after the old table
//! 7. create tables in foreign-key order, breaking cycles
//! 8. rename, add, then alter columns
//! 9. add non-FK constraints, then indexes
//! 10. add foreign keys (new ones and those deferred from step 7)
//! 11. drop enums
//!
//! Every step carries the model-level changes it performs, so folding a
//! plan prefix into the starting schema yields the exact intermediate state.

pub mod dialect;
pub mod graph;

pub use dialect::{Dialect, Operation, PostgresDialect};
pub use graph::DependencyGraph;

use crate::diff::{Change, Delta, DiffSummary, EnumEdit, FieldChange};
use crate::error::{ambiguous_change, MigrateError, Result};
use crate::model::{Column, Constraint, ConstraintKind, EnumType, ForeignKey, Index, LogicalType, Schema, Table, TypeChange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

/// How dangerous a step is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Safe,
    /// Cannot prove data survives (opaque type changes, SET NOT NULL)
    RequiresManualConfirmation,
    DataLossRisk,
}

impl Classification {
    pub fn is_safe(&self) -> bool {
        matches!(self, Classification::Safe)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Safe => write!(f, "safe"),
            Classification::RequiresManualConfirmation => write!(f, "requires-manual-confirmation"),
            Classification::DataLossRisk => write!(f, "data-loss-risk"),
        }
    }
}

/// One executable unit of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub number: usize,
    pub description: String,
    pub statements: Vec<String>,
    pub classification: Classification,
    /// False when the dialect forbids running it inside a transaction
    pub transactional: bool,
    pub operation: Operation,
    /// Model effect of the step once its statements succeed
    pub changes: Vec<Change>,
}

/// Ordered, classified list of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub namespace: String,
    pub dialect: String,
    pub generated_at: DateTime<Utc>,
    pub summary: DiffSummary,
    pub steps: Vec<Step>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Steps that are not `safe`
    pub fn risky_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| !s.classification.is_safe())
    }

    pub fn requires_confirmation(&self) -> bool {
        self.risky_steps().next().is_some()
    }

    /// Highest classification in the plan
    pub fn classification(&self) -> Classification {
        self.steps
            .iter()
            .map(|s| s.classification)
            .max()
            .unwrap_or(Classification::Safe)
    }

    /// The schema reached after the first `count` steps succeed
    pub fn fold_through(&self, before: &Schema, count: usize) -> Schema {
        let mut schema = before.clone().normalized();
        for step in self.steps.iter().take(count) {
            for change in &step.changes {
                change.apply_to(&mut schema);
            }
        }
        schema.normalized()
    }

    /// The schema reached when every step succeeds
    pub fn fold(&self, before: &Schema) -> Schema {
        self.fold_through(before, self.steps.len())
    }

    /// Whole plan as a SQL script, one statement per line group
    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            out.push_str(&format!("-- Step {} [{}]: {}\n", step.number, step.classification, step.description));
            if !step.transactional {
                out.push_str("-- (runs outside a transaction)\n");
            }
            for statement in &step.statements {
                out.push_str(statement);
                out.push_str(";\n");
            }
            out.push('\n');
        }
        out
    }
}

/// Accumulates steps while tracking the schema they produce
struct StepBuilder<'d> {
    dialect: &'d dyn Dialect,
    current: Schema,
    steps: Vec<Step>,
}

impl<'d> StepBuilder<'d> {
    fn push(&mut self, operation: Operation, description: String, classification: Classification, changes: Vec<Change>) {
        for change in &changes {
            change.apply_to(&mut self.current);
        }
        let step = Step {
            number: self.steps.len() + 1,
            statements: self.dialect.render(&operation),
            transactional: self.dialect.is_transactional(&operation),
            description,
            classification,
            operation,
            changes,
        };
        debug!("Step {} [{}]: {}", step.number, step.classification, step.description);
        self.steps.push(step);
    }

    fn drop_constraint(&mut self, table: &str, constraint: &Constraint) {
        self.push(
            Operation::DropConstraint {
                table: table.to_string(),
                name: constraint.name.clone(),
            },
            format!("Drop {} {} on {}", constraint.kind_label(), constraint.name, table),
            Classification::Safe,
            vec![Change::DropConstraint {
                table: table.to_string(),
                constraint: constraint.clone(),
            }],
        );
    }

    fn add_constraint(&mut self, table: &str, constraint: &Constraint) {
        self.push(
            Operation::AddConstraint {
                table: table.to_string(),
                constraint: constraint.clone(),
            },
            format!("Add {} {} on {}", constraint.kind_label(), constraint.name, table),
            Classification::Safe,
            vec![Change::AddConstraint {
                table: table.to_string(),
                constraint: constraint.clone(),
            }],
        );
    }

    fn create_index(&mut self, table: &str, index: &Index) {
        self.push(
            Operation::CreateIndex {
                table: table.to_string(),
                index: index.clone(),
            },
            format!("Create {}index {} on {}", if index.unique { "unique " } else { "" }, index.name, table),
            Classification::Safe,
            vec![Change::CreateIndex {
                table: table.to_string(),
                index: index.clone(),
            }],
        );
    }
}

/// Table renames declared by the delta, new name → live name
struct Renames(HashMap<String, String>);

impl Renames {
    fn from_delta(delta: &Delta) -> Self {
        Self(
            delta
                .iter()
                .filter_map(|c| match c {
                    Change::RenameTable { from, to } => Some((to.clone(), from.clone())),
                    _ => None,
                })
                .collect(),
        )
    }

    /// Name of the table before any rename step has run
    fn live<'a>(&'a self, table: &'a str) -> &'a str {
        self.0.get(table).map(String::as_str).unwrap_or(table)
    }
}

/// Orders deltas into executable plans for one dialect
pub struct Planner<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> Planner<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    /// Live table names whose emptiness decides whether the plan is
    /// ambiguous (tables gaining a NOT NULL column with no value source)
    pub fn tables_needing_row_check(delta: &Delta) -> Vec<String> {
        let renames = Renames::from_delta(delta);
        let mut tables: Vec<String> = delta
            .iter()
            .filter_map(|c| match c {
                Change::AddColumn { table, column } if Self::needs_value(column) => {
                    Some(renames.live(table).to_string())
                }
                _ => None,
            })
            .collect();
        tables.sort();
        tables.dedup();
        tables
    }

    fn needs_value(column: &Column) -> bool {
        !column.nullable && !column.has_value_source()
    }

    /// Build the plan. `row_presence` maps live table names to whether they
    /// hold rows; tables missing from the map are assumed to hold rows.
    pub fn plan(&self, before: &Schema, delta: &Delta, row_presence: &HashMap<String, bool>) -> Result<MigrationPlan> {
        let before = before.clone().normalized();
        let renames = Renames::from_delta(delta);

        Self::check_ambiguity(delta, &renames, row_presence)?;
        let created: Vec<&Table> = delta
            .iter()
            .filter_map(|c| match c {
                Change::CreateTable { table } => Some(table),
                _ => None,
            })
            .collect();
        let (creation_order, cycle_fks) = Self::creation_order(&created)?;

        let mut builder = StepBuilder {
            dialect: self.dialect,
            current: before.clone(),
            steps: Vec::new(),
        };

        Self::drop_foreign_keys(&mut builder, delta, &renames);
        Self::drop_constraints_and_indexes(&mut builder, delta, &renames);
        Self::drop_columns(&mut builder, delta, &renames);
        Self::drop_tables(&mut builder, delta);
        Self::create_and_alter_enums(&mut builder, delta);
        Self::rename_tables(&mut builder, delta);
        let deferred = Self::create_tables(&mut builder, &created, &creation_order, &cycle_fks);
        Self::rename_add_alter_columns(&mut builder, delta);
        Self::add_constraints_and_indexes(&mut builder, delta, &created);
        Self::add_foreign_keys(&mut builder, delta, &deferred);
        Self::drop_enums(&mut builder, delta);

        let plan = MigrationPlan {
            namespace: before.name.clone(),
            dialect: self.dialect.name().to_string(),
            generated_at: Utc::now(),
            summary: delta.summary(),
            steps: builder.steps,
        };

        info!(
            "Planned {} steps for {} changes ({} need confirmation)",
            plan.len(),
            delta.len(),
            plan.risky_steps().count()
        );
        Ok(plan)
    }

    fn check_ambiguity(delta: &Delta, renames: &Renames, row_presence: &HashMap<String, bool>) -> Result<()> {
        for change in delta.iter() {
            if let Change::AddColumn { table, column } = change {
                if !Self::needs_value(column) {
                    continue;
                }
                let live = renames.live(table);
                let reason = match row_presence.get(live) {
                    Some(false) => continue,
                    Some(true) => "NOT NULL column without a default on a table that has rows",
                    None => "NOT NULL column without a default on a table that may have rows",
                };
                return Err(ambiguous_change(format!("{}.{}", table, column.name), reason));
            }
        }
        Ok(())
    }

    /// Order new tables so referenced tables come first. Foreign keys on a
    /// cycle are split out and added after every table exists.
    fn creation_order(created: &[&Table]) -> Result<(Vec<String>, HashSet<(String, String)>)> {
        let names: HashSet<&str> = created.iter().map(|t| t.name.as_str()).collect();
        let mut graph = DependencyGraph::new();
        for table in created {
            graph.add_node(&table.name);
            for (_, fk) in table.foreign_keys() {
                if names.contains(fk.referenced_table.as_str()) {
                    graph.add_edge(&table.name, &fk.referenced_table);
                }
            }
        }

        let mut cycle_fks = HashSet::new();
        for cycle in graph.cycles() {
            let members: HashSet<&str> = cycle.iter().map(String::as_str).collect();
            let mut on_cycle: Vec<(&Table, &Constraint, &ForeignKey)> = Vec::new();
            for table in created.iter().filter(|t| members.contains(t.name.as_str())) {
                for (constraint, fk) in table.foreign_keys() {
                    if fk.referenced_table != table.name && members.contains(fk.referenced_table.as_str()) {
                        on_cycle.push((table, constraint, fk));
                    }
                }
            }

            if on_cycle.iter().all(|(table, _, fk)| Self::blocks_insert(table, fk)) {
                return Err(MigrateError::UnresolvableCycle {
                    tables: cycle.clone(),
                    reason: "every foreign key on the cycle is NOT NULL without a default and not deferrable, \
                             so no row could ever be inserted"
                        .to_string(),
                });
            }

            debug!("Breaking foreign key cycle between {:?}", cycle);
            for (table, constraint, fk) in on_cycle {
                graph.remove_edge(&table.name, &fk.referenced_table);
                cycle_fks.insert((table.name.clone(), constraint.name.clone()));
            }
        }

        let order = graph.topological_order().ok_or_else(|| MigrateError::UnresolvableCycle {
            tables: {
                let mut tables: Vec<String> = names.iter().map(|n| n.to_string()).collect();
                tables.sort();
                tables
            },
            reason: "foreign keys between new tables could not be ordered".to_string(),
        })?;
        Ok((order, cycle_fks))
    }

    /// A foreign key that forces every row to reference an existing row
    fn blocks_insert(table: &Table, fk: &ForeignKey) -> bool {
        !fk.deferrable
            && fk
                .columns
                .iter()
                .all(|c| table.column(c).is_some_and(|col| Self::needs_value(col)))
    }

    // ---- phase 1 ----------------------------------------------------------

    fn drop_foreign_keys(b: &mut StepBuilder, delta: &Delta, renames: &Renames) {
        // Every outgoing link of a dropped table goes first: table drops then
        // need no particular order, and keys or columns the link relied on
        // can be dropped in phases 2-3
        for change in delta.iter() {
            if let Change::DropTable { table } = change {
                for (constraint, fk) in table.foreign_keys() {
                    if fk.referenced_table != table.name {
                        b.drop_constraint(&table.name, constraint);
                    }
                }
            }
        }

        for change in delta.iter() {
            match change {
                Change::DropConstraint { table, constraint }
                | Change::AlterConstraint {
                    table,
                    before: constraint,
                    ..
                } if constraint.as_foreign_key().is_some() => {
                    b.drop_constraint(renames.live(table), constraint);
                }
                _ => {}
            }
        }
    }

    // ---- phase 2 ----------------------------------------------------------

    fn drop_constraints_and_indexes(b: &mut StepBuilder, delta: &Delta, renames: &Renames) {
        for change in delta.iter() {
            match change {
                Change::DropConstraint { table, constraint }
                | Change::AlterConstraint {
                    table,
                    before: constraint,
                    ..
                } if constraint.as_foreign_key().is_none() => {
                    b.drop_constraint(renames.live(table), constraint);
                }
                _ => {}
            }
        }

        for change in delta.iter() {
            match change {
                Change::DropIndex { table, index } | Change::AlterIndex { table, before: index, .. } => {
                    let live = renames.live(table);
                    b.push(
                        Operation::DropIndex { name: index.name.clone() },
                        format!("Drop index {} on {}", index.name, live),
                        Classification::Safe,
                        vec![Change::DropIndex {
                            table: live.to_string(),
                            index: index.clone(),
                        }],
                    );
                }
                _ => {}
            }
        }
    }

    // ---- phase 3 ----------------------------------------------------------

    fn drop_columns(b: &mut StepBuilder, delta: &Delta, renames: &Renames) {
        for change in delta.iter() {
            if let Change::DropColumn { table, column } = change {
                let live = renames.live(table);
                b.push(
                    Operation::DropColumn {
                        table: live.to_string(),
                        column: column.name.clone(),
                    },
                    format!("Drop column {}.{}", live, column.name),
                    Classification::DataLossRisk,
                    vec![Change::DropColumn {
                        table: live.to_string(),
                        column: column.clone(),
                    }],
                );
            }
        }
    }

    // ---- phase 4 ----------------------------------------------------------

    fn drop_tables(b: &mut StepBuilder, delta: &Delta) {
        let dropped: HashMap<&str, &Table> = delta
            .iter()
            .filter_map(|c| match c {
                Change::DropTable { table } => Some((table.name.as_str(), table)),
                _ => None,
            })
            .collect();

        let mut graph = DependencyGraph::new();
        for table in dropped.values() {
            graph.add_node(&table.name);
            for (_, fk) in table.foreign_keys() {
                graph.add_edge(&table.name, &fk.referenced_table);
            }
        }
        // Inter-table links are gone after phase 1, any cycle is harmless
        let mut order = graph.topological_order().unwrap_or_else(|| {
            let mut names: Vec<String> = dropped.keys().map(|n| n.to_string()).collect();
            names.sort();
            names
        });
        order.reverse();

        for name in order {
            let Some(table) = dropped.get(name.as_str()) else {
                continue;
            };
            b.push(
                Operation::DropTable { name: name.clone() },
                format!("Drop table {}", name),
                Classification::DataLossRisk,
                vec![Change::DropTable { table: (*table).clone() }],
            );
        }
    }

    // ---- phase 5 ----------------------------------------------------------

    fn create_and_alter_enums(b: &mut StepBuilder, delta: &Delta) {
        for change in delta.iter() {
            match change {
                Change::CreateEnum { enum_type } => b.push(
                    Operation::CreateEnum {
                        enum_type: enum_type.clone(),
                    },
                    format!("Create enum {}", enum_type.name),
                    Classification::Safe,
                    vec![change.clone()],
                ),
                Change::AlterEnum { before, after, edits } if edits.iter().all(EnumEdit::is_additive) => {
                    Self::add_enum_labels(b, before, edits);
                    debug_assert_eq!(b.current.enum_type(&after.name), Some(after));
                }
                Change::AlterEnum { before, after, edits } => {
                    let dependents = Self::enum_dependents(&b.current, &after.name);
                    let removes = edits.iter().any(|e| matches!(e, EnumEdit::Remove { .. }));
                    b.push(
                        Operation::RecreateEnum {
                            after: after.clone(),
                            dependents: dependents.clone(),
                        },
                        format!(
                            "Recreate enum {} with labels [{}] and re-cast {} column(s)",
                            after.name,
                            after.labels.join(", "),
                            dependents.len()
                        ),
                        if removes {
                            Classification::DataLossRisk
                        } else {
                            Classification::Safe
                        },
                        vec![Change::AlterEnum {
                            before: before.clone(),
                            after: after.clone(),
                            edits: edits.clone(),
                        }],
                    );
                }
                _ => {}
            }
        }
    }

    fn add_enum_labels(b: &mut StepBuilder, before: &EnumType, edits: &[EnumEdit]) {
        let mut current = before.clone();
        for edit in edits {
            let mut next = current.clone();
            let (label, position) = match edit {
                EnumEdit::Append { label } => {
                    next.labels.push(label.clone());
                    (label, None)
                }
                EnumEdit::InsertBefore { label, before } => {
                    let at = next.labels.iter().position(|l| l == before).unwrap_or(next.labels.len());
                    next.labels.insert(at, label.clone());
                    (label, Some(before.clone()))
                }
                _ => continue,
            };
            let description = match &position {
                Some(anchor) => format!("Add label '{}' to enum {} before '{}'", label, current.name, anchor),
                None => format!("Add label '{}' to enum {}", label, current.name),
            };
            b.push(
                Operation::AddEnumLabel {
                    name: current.name.clone(),
                    label: label.clone(),
                    before: position,
                },
                description,
                Classification::Safe,
                vec![Change::AlterEnum {
                    before: current.clone(),
                    after: next.clone(),
                    edits: vec![edit.clone()],
                }],
            );
            current = next;
        }
    }

    /// Columns currently typed with the enum (directly or as array element)
    fn enum_dependents(schema: &Schema, enum_name: &str) -> Vec<(String, Column)> {
        let uses = |ty: &LogicalType| match ty {
            LogicalType::Enum { name } => name == enum_name,
            LogicalType::Array { element } => element.enum_name() == Some(enum_name),
            _ => false,
        };
        let mut dependents = Vec::new();
        for table in &schema.tables {
            for column in &table.columns {
                if uses(&column.logical_type) {
                    dependents.push((table.name.clone(), column.clone()));
                }
            }
        }
        dependents.sort_by(|a, b| (&a.0, &a.1.name).cmp(&(&b.0, &b.1.name)));
        dependents
    }

    // ---- phase 6 ----------------------------------------------------------

    fn rename_tables(b: &mut StepBuilder, delta: &Delta) {
        for change in delta.iter() {
            if let Change::RenameTable { from, to } = change {
                b.push(
                    Operation::RenameTable {
                        from: from.clone(),
                        to: to.clone(),
                    },
                    format!("Rename table {} to {}", from, to),
                    Classification::Safe,
                    vec![change.clone()],
                );
            }
        }

        for change in delta.iter() {
            if let Change::RenameConstraint { table, from, to } = change {
                b.push(
                    Operation::RenameConstraint {
                        table: table.clone(),
                        from: from.clone(),
                        to: to.clone(),
                    },
                    format!("Rename constraint {} on {} to {}", from, table, to),
                    Classification::Safe,
                    vec![change.clone()],
                );
            }
        }
    }

    // ---- phase 7 ----------------------------------------------------------

    /// Returns foreign keys left for phase 10
    fn create_tables(
        b: &mut StepBuilder,
        created: &[&Table],
        order: &[String],
        cycle_fks: &HashSet<(String, String)>,
    ) -> Vec<(String, Constraint)> {
        let mut deferred = Vec::new();

        for name in order {
            let Some(table) = created.iter().find(|t| &t.name == name) else {
                continue;
            };

            let mut shell = (*table).clone();
            shell.renamed_from = None;
            shell.indexes.clear();
            for column in &mut shell.columns {
                column.renamed_from = None;
            }

            let mut inline = Vec::new();
            for constraint in &table.constraints {
                let ready = match constraint.as_foreign_key() {
                    None => true,
                    Some(_) if cycle_fks.contains(&(table.name.clone(), constraint.name.clone())) => false,
                    Some(fk) if fk.referenced_table == table.name => {
                        Self::has_key(&table.constraints, &fk.referenced_columns)
                    }
                    Some(fk) => b
                        .current
                        .table(&fk.referenced_table)
                        .is_some_and(|t| Self::has_key(&t.constraints, &fk.referenced_columns)),
                };
                if ready {
                    inline.push(constraint.clone());
                } else {
                    deferred.push((table.name.clone(), constraint.clone()));
                }
            }
            shell.constraints = inline;

            b.push(
                Operation::CreateTable { table: shell.clone() },
                format!("Create table {} ({} columns)", shell.name, shell.columns.len()),
                Classification::Safe,
                vec![Change::CreateTable { table: shell }],
            );
        }

        deferred
    }

    /// Whether `columns` are covered by a primary key or unique constraint,
    /// which a foreign key needs on its referenced side
    fn has_key(constraints: &[Constraint], columns: &[String]) -> bool {
        let wanted: HashSet<&String> = columns.iter().collect();
        let same = |cols: &[String]| cols.len() == wanted.len() && cols.iter().all(|c| wanted.contains(c));

        constraints.iter().any(|c| match &c.kind {
            ConstraintKind::PrimaryKey { columns } | ConstraintKind::Unique { columns } => same(columns),
            _ => false,
        })
    }

    // ---- phase 8 ----------------------------------------------------------

    fn rename_add_alter_columns(b: &mut StepBuilder, delta: &Delta) {
        let mut alters: Vec<(String, Column, Column, Vec<FieldChange>)> = Vec::new();

        for change in delta.iter() {
            if let Change::AlterColumn { table, before, after, fields } = change {
                let mut current = before.clone();
                let rest: Vec<FieldChange> = fields
                    .iter()
                    .filter(|f| !matches!(f, FieldChange::Renamed { .. }))
                    .cloned()
                    .collect();

                if before.name != after.name {
                    let mut renamed = before.clone();
                    renamed.name = after.name.clone();
                    b.push(
                        Operation::RenameColumn {
                            table: table.clone(),
                            from: before.name.clone(),
                            to: after.name.clone(),
                        },
                        format!("Rename column {}.{} to {}", table, before.name, after.name),
                        Classification::Safe,
                        vec![Change::AlterColumn {
                            table: table.clone(),
                            before: before.clone(),
                            after: renamed.clone(),
                            fields: vec![FieldChange::Renamed {
                                from: before.name.clone(),
                                to: after.name.clone(),
                            }],
                        }],
                    );
                    current = renamed;
                }

                if !rest.is_empty() {
                    alters.push((table.clone(), current, after.clone(), rest));
                }
            }
        }

        for change in delta.iter() {
            if let Change::AddColumn { table, column } = change {
                let mut column = column.clone();
                column.renamed_from = None;
                b.push(
                    Operation::AddColumn {
                        table: table.clone(),
                        column: column.clone(),
                    },
                    format!("Add column {}.{} {}", table, column.name, column.logical_type),
                    Classification::Safe,
                    vec![Change::AddColumn {
                        table: table.clone(),
                        column,
                    }],
                );
            }
        }

        for (table, before, mut after, fields) in alters {
            after.renamed_from = None;
            let description = format!(
                "Alter column {}.{}: {}",
                table,
                after.name,
                fields.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ")
            );
            b.push(
                Operation::AlterColumn {
                    table: table.clone(),
                    before: before.clone(),
                    after: after.clone(),
                },
                description,
                Self::classify_fields(&fields),
                vec![Change::AlterColumn {
                    table,
                    before,
                    after,
                    fields,
                }],
            );
        }
    }

    fn classify_fields(fields: &[FieldChange]) -> Classification {
        fields
            .iter()
            .map(|field| match field {
                FieldChange::Type { from, to } => match from.change_to(to) {
                    TypeChange::Same | TypeChange::Widening => Classification::Safe,
                    TypeChange::Narrowing => Classification::DataLossRisk,
                    TypeChange::Incompatible => Classification::RequiresManualConfirmation,
                },
                FieldChange::Nullable { from: true, to: false } => Classification::RequiresManualConfirmation,
                // A new expression means drop and re-add the column
                FieldChange::Generated { to: Some(_), .. } => Classification::DataLossRisk,
                FieldChange::Generated { to: None, .. } => Classification::RequiresManualConfirmation,
                _ => Classification::Safe,
            })
            .max()
            .unwrap_or(Classification::Safe)
    }

    // ---- phase 9 ----------------------------------------------------------

    fn add_constraints_and_indexes(b: &mut StepBuilder, delta: &Delta, created: &[&Table]) {
        for change in delta.iter() {
            match change {
                Change::AddConstraint { table, constraint }
                | Change::AlterConstraint {
                    table,
                    after: constraint,
                    ..
                } if constraint.as_foreign_key().is_none() => b.add_constraint(table, constraint),
                _ => {}
            }
        }

        for table in created {
            for index in &table.indexes {
                b.create_index(&table.name, index);
            }
        }

        for change in delta.iter() {
            match change {
                Change::CreateIndex { table, index } | Change::AlterIndex { table, after: index, .. } => {
                    b.create_index(table, index)
                }
                _ => {}
            }
        }
    }

    // ---- phase 10 ---------------------------------------------------------

    fn add_foreign_keys(b: &mut StepBuilder, delta: &Delta, deferred: &[(String, Constraint)]) {
        for (table, constraint) in deferred {
            b.add_constraint(table, constraint);
        }

        for change in delta.iter() {
            match change {
                Change::AddConstraint { table, constraint }
                | Change::AlterConstraint {
                    table,
                    after: constraint,
                    ..
                } if constraint.as_foreign_key().is_some() => b.add_constraint(table, constraint),
                _ => {}
            }
        }
    }

    // ---- phase 11 ---------------------------------------------------------

    fn drop_enums(b: &mut StepBuilder, delta: &Delta) {
        for change in delta.iter() {
            if let Change::DropEnum { enum_type } = change {
                b.push(
                    Operation::DropEnum {
                        name: enum_type.name.clone(),
                    },
                    format!("Drop enum {}", enum_type.name),
                    Classification::Safe,
                    vec![change.clone()],
                );
            }
        }
    }
}
