//! Flush planning - turns a write-set into an ordered list of row operations
//!
//! Order of the plan:
//! 1. inserts of New nodes, dependencies first
//! 2. links filling reference columns deferred to break cycles
//! 3. updates, in registration order
//! 4. join-table attach/detach
//! 5. deletes, in registration order

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use crate::Result;
use crate::key::NodeKey;
use crate::manager::Shared;
use crate::mapping::{DbMapping, RelationKind};
use crate::node::Lifecycle;
use crate::storage::RowOp;
use crate::value::Value;
use super::{Entry, TxId, WriteSet};

/// Insertion order for a set of new rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InsertOrder {
    /// Row indexes in the order they are inserted
    pub(crate) order: Vec<usize>,
    /// `(row, dependency)` edges inserted as NULL and linked afterwards
    pub(crate) deferred: Vec<(usize, usize)>,
}

/// Topological order of rows where `deps[i]` lists the rows `i` references.
///
/// Ties go to the lowest index. When only cycles remain, the lowest
/// remaining row is inserted first and its edges to rows not yet inserted
/// are deferred.
pub(crate) fn insertion_order(deps: &[BTreeSet<usize>]) -> InsertOrder {
    let n = deps.len();
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (row, row_deps) in deps.iter().enumerate() {
        for &dep in row_deps {
            if dep != row && dep < n {
                indegree[row] += 1;
                dependents[dep].push(row);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut deferred = Vec::new();

    while order.len() < n {
        let next = match ready.pop_first() {
            Some(row) => row,
            None => {
                // only cycles left
                let row = (0..n).find(|&i| !placed[i]).unwrap_or_default();
                for &dep in &deps[row] {
                    if dep != row && dep < n && !placed[dep] {
                        deferred.push((row, dep));
                    }
                }
                row
            }
        };

        placed[next] = true;
        order.push(next);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 && !placed[dependent] {
                ready.insert(dependent);
            }
        }
    }

    InsertOrder { order, deferred }
}

struct NewRow<'a> {
    entry: &'a Entry,
    props: BTreeMap<String, Value>,
    created: DateTime<Utc>,
}

/// Build the row operations that persist `ws`
pub(crate) fn plan(shared: &Arc<Shared>, tx_id: TxId, ws: &WriteSet, now: DateTime<Utc>) -> Result<Vec<RowOp>> {
    let mut rows = Vec::new();
    let mut updates = Vec::new();
    let mut deletes = Vec::new();

    for entry in &ws.entries {
        let mapping = entry.node.mapping();
        let (lifecycle, tombstoned, props, created) = {
            let inner = entry.node.inner.lock();
            (inner.lifecycle, inner.tombstoned_by == Some(tx_id), inner.props.clone(), inner.created)
        };
        if !mapping.is_relational() {
            continue;
        }
        match lifecycle {
            // created and deleted in the same unit: nothing to write
            Lifecycle::New(_) if tombstoned => {}
            Lifecycle::New(_) => rows.push(NewRow { entry, props, created }),
            Lifecycle::Persistent if tombstoned => deletes.push(entry),
            Lifecycle::Persistent if !entry.changes.is_empty() => updates.push(entry),
            _ => {}
        }
    }

    let positions: HashMap<&NodeKey, usize> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| (row.entry.node.key(), i))
        .collect();
    let deps: Vec<BTreeSet<usize>> = rows
        .iter()
        .map(|row| {
            row.props
                .values()
                .filter_map(Value::as_reference)
                .filter_map(|key| positions.get(key).copied())
                .collect()
        })
        .collect();
    let InsertOrder { order, deferred } = insertion_order(&deps);

    let mut ops = Vec::with_capacity(ws.entries.len() + ws.links.len());
    let mut links = Vec::new();
    for idx in order {
        let row = &rows[idx];
        let node = &row.entry.node;
        let mapping = node.mapping();
        let postponed: BTreeSet<&NodeKey> = deferred
            .iter()
            .filter(|(from, _)| *from == idx)
            .map(|(_, to)| rows[*to].entry.node.key())
            .collect();

        let mut columns = Vec::new();
        let mut linked = Vec::new();
        for (property, value) in &row.props {
            let Some(column) = mapping.column_for(property) else { continue };
            let stored = column_value(shared, mapping, property, value)?;
            match value.as_reference() {
                Some(target) if postponed.contains(target) => {
                    columns.push((column.name().to_string(), Value::Null));
                    linked.push((column.name().to_string(), stored));
                }
                _ => columns.push((column.name().to_string(), stored)),
            }
        }

        let (table, id_column) = table_of(mapping);
        ops.push(RowOp::Insert {
            key: node.key().clone(),
            table: table.clone(),
            id_column: id_column.clone(),
            columns,
            created: row.created,
            modified: now,
        });
        if !linked.is_empty() {
            links.push(RowOp::Link { key: node.key().clone(), table, id_column, columns: linked });
        }
    }
    ops.extend(links);

    for entry in updates {
        let mapping = entry.node.mapping();
        let mut columns = Vec::new();
        for (property, value) in &entry.changes {
            if let Some(column) = mapping.column_for(property) {
                columns.push((column.name().to_string(), column_value(shared, mapping, property, value)?));
            }
        }
        let (table, id_column) = table_of(mapping);
        ops.push(RowOp::Update {
            key: entry.node.key().clone(),
            table,
            id_column,
            columns,
            expected_version: entry.base_version,
            modified: now,
        });
    }

    for link in &ws.links {
        let op = if link.attach {
            RowOp::AttachChild { join: link.join.clone(), parent: link.parent.clone(), child: link.child.clone() }
        } else {
            RowOp::DetachChild { join: link.join.clone(), parent: link.parent.clone(), child: link.child.clone() }
        };
        ops.push(op);
    }

    for entry in deletes {
        let (table, id_column) = table_of(entry.node.mapping());
        ops.push(RowOp::Delete {
            key: entry.node.key().clone(),
            table,
            id_column,
            expected_version: entry.base_version,
        });
    }

    Ok(ops)
}

fn table_of(mapping: &DbMapping) -> (String, String) {
    (mapping.table().unwrap_or_default().to_string(), mapping.id_column().to_string())
}

/// Storage value of one property.
///
/// References store the target id, or the target's join-column value when
/// the relation joins on another column.
fn column_value(shared: &Arc<Shared>, mapping: &DbMapping, property: &str, value: &Value) -> Result<Value> {
    let Some(key) = value.as_reference() else {
        return Ok(value.clone());
    };
    let relation = mapping.relation_for(property);
    let join = relation
        .filter(|r| r.kind() == RelationKind::Reference)
        .and_then(|r| r.join_column())
        .filter(|join| relation.and_then(|r| r.target_table()).is_none_or(|t| t.id_column != *join));

    match join {
        Some(join) => {
            let target = shared.get_node(key)?;
            let value = target
                .mapping()
                .property_for_column(join)
                .and_then(|p| target.get(p))
                .unwrap_or(Value::Null);
            Ok(value)
        }
        None => Ok(Value::Text(key.id.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn deps(edges: &[&[usize]]) -> Vec<BTreeSet<usize>> {
        edges.iter().map(|e| e.iter().copied().collect()).collect()
    }

    #[test]
    fn test_dependencies_go_first() {
        // 0 -> 2, 1 -> 0
        let result = insertion_order(&deps(&[&[2], &[0], &[]]));
        assert_eq!(result.order, vec![2, 0, 1]);
        assert!(result.deferred.is_empty());
    }

    #[test]
    fn test_cycle_is_broken_at_lowest_row() {
        // 0 <-> 1, 2 -> 1
        let result = insertion_order(&deps(&[&[1], &[0], &[1]]));
        assert_eq!(result.order, vec![0, 1, 2]);
        assert_eq!(result.deferred, vec![(0, 1)]);
    }

    #[test]
    fn test_self_reference_needs_no_link() {
        let result = insertion_order(&deps(&[&[0]]));
        assert_eq!(result.order, vec![0]);
        assert!(result.deferred.is_empty());
    }

    fn graph() -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
        (1usize..12).prop_flat_map(|n| {
            proptest::collection::vec(proptest::collection::btree_set(0..n, 0..4), n)
        })
    }

    proptest! {
        #[test]
        fn prop_order_respects_every_kept_edge(deps in graph()) {
            let result = insertion_order(&deps);

            let mut sorted = result.order.clone();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..deps.len()).collect::<Vec<_>>());

            let mut pos = vec![0; deps.len()];
            for (i, &row) in result.order.iter().enumerate() {
                pos[row] = i;
            }
            for (row, row_deps) in deps.iter().enumerate() {
                for &dep in row_deps {
                    if dep == row {
                        continue;
                    }
                    if result.deferred.contains(&(row, dep)) {
                        prop_assert!(pos[dep] > pos[row]);
                    } else {
                        prop_assert!(pos[dep] < pos[row]);
                    }
                }
            }

            prop_assert_eq!(insertion_order(&deps), result);
        }

        #[test]
        fn prop_acyclic_graphs_need_no_links(deps in graph()) {
            // keep only edges to lower rows: always acyclic
            let acyclic: Vec<BTreeSet<usize>> = deps
                .iter()
                .enumerate()
                .map(|(row, d)| d.iter().copied().filter(|&dep| dep < row).collect())
                .collect();
            prop_assert!(insertion_order(&acyclic).deferred.is_empty());
        }
    }
}
