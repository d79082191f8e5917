//! Ownership inference over the foreign-key graph.
//!
//! A row may be changed by a user when it, every parent entry it derives
//! from, and (for the row itself) every dependent entry is owned by the user
//! or one of their groups. Tables without an owner column and without
//! unvisited parents are shared data and pass.

use crate::config::AppConfig;
use crate::core::{Restriction, Result, Row, Value};
use crate::storage::{Database, ForeignKey};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
    Both,
}

pub struct PermissionWalker<'a> {
    db: &'a Database,
    config: &'a AppConfig,
}

struct Walk<'w> {
    user: &'w str,
    groups: Vec<Value>,
    visited: HashSet<String>,
}

impl<'a> PermissionWalker<'a> {
    pub fn new(db: &'a Database, config: &'a AppConfig) -> Self {
        Self { db, config }
    }

    pub fn user_has_permission(&self, table: &str, restriction: &Restriction, user: &str) -> Result<bool> {
        if self.config.is_administrator(user) {
            return Ok(true);
        }

        let mut walk = Walk {
            user,
            groups: self.groups_of(user)?,
            visited: HashSet::new(),
        };
        let rows = self.db.fetch(table, restriction)?;
        let allowed = self.check(table, rows, Direction::Both, &mut walk)?;
        debug!(table = %table, user = %user, allowed, visited = walk.visited.len(), "permission walk");
        Ok(allowed)
    }

    /// Groups `user` belongs to, per the configured group table.
    pub fn groups_of(&self, user: &str) -> Result<Vec<Value>> {
        let Some(group_table) = &self.config.group_table else {
            return Ok(Vec::new());
        };
        if !self.db.catalog().table_exists(group_table) {
            warn!(table = %group_table, "group table is not declared");
            return Ok(Vec::new());
        }

        let restriction = Restriction::from([(self.config.group_member.clone(), Value::from(user))]);
        Ok(self
            .db
            .project(group_table, &[self.config.group_name.as_str()], &restriction)?
            .into_iter()
            .filter_map(|row| row.get(&self.config.group_name).cloned())
            .collect())
    }

    fn check(&self, table: &str, rows: Vec<Row>, direction: Direction, walk: &mut Walk<'_>) -> Result<bool> {
        walk.visited.insert(table.to_string());
        if rows.is_empty() {
            return Ok(true);
        }

        let owner_column = &self.config.user_name;
        let owned = self.db.catalog().get_table(table)?.heading().contains(owner_column);
        if owned {
            let user = Value::from(walk.user);
            let all_owned = rows.iter().all(|row| match row.get(owner_column) {
                Some(owner) => *owner == user || walk.groups.contains(owner),
                None => false,
            });
            // the selected rows still need their dependents checked
            if !all_owned || direction != Direction::Both {
                return Ok(all_owned);
            }
        }

        if direction != Direction::Down && !owned {
            for fk in self.db.catalog().parents(table) {
                if walk.visited.contains(&fk.parent) {
                    continue;
                }
                let parent_rows = self.related_rows(&fk.parent, &rows, fk, |child, parent| (child, parent))?;
                if !self.check(&fk.parent, parent_rows, Direction::Up, walk)? {
                    return Ok(false);
                }
            }
        }

        if direction != Direction::Up {
            for fk in self.db.catalog().children(table) {
                if walk.visited.contains(&fk.child) {
                    continue;
                }
                let child_rows = self.related_rows(&fk.child, &rows, fk, |child, parent| (parent, child))?;
                if !self.check(&fk.child, child_rows, Direction::Down, walk)? {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Rows of `target` reachable from `rows` through `fk`. `orient` maps a
    /// (child attr, parent attr) pair to (attr read from `rows`, attr matched
    /// in `target`). References with a null value are skipped.
    fn related_rows(
        &self,
        target: &str,
        rows: &[Row],
        fk: &ForeignKey,
        orient: impl Fn(String, String) -> (String, String),
    ) -> Result<Vec<Row>> {
        let mut restrictions = BTreeSet::new();
        for row in rows {
            let mut restriction = Restriction::new();
            for (child_attr, parent_attr) in &fk.attr_map {
                let (source, matched) = orient(child_attr.clone(), parent_attr.clone());
                match row.get(&source) {
                    Some(value) if !value.is_null() => {
                        restriction.insert(matched, value.clone());
                    }
                    _ => break,
                }
            }
            if restriction.len() == fk.attr_map.len() {
                restrictions.insert(restriction);
            }
        }

        let mut related = Vec::new();
        for restriction in &restrictions {
            related.extend(self.db.fetch(target, restriction)?);
        }
        Ok(related)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declare::declare;
    use crate::schema::AdapterRegistry;
    use crate::storage::Tier;

    fn setup() -> Database {
        let adapters = AdapterRegistry::default();
        let mut db = Database::new();
        declare(&mut db, "lab.Experimenter", Tier::Manual, "experimenter : varchar(31)", &adapters).unwrap();
        declare(&mut db, "lab.Subject", Tier::Manual, "subject_id : int\n---\n-> Experimenter", &adapters).unwrap();
        declare(&mut db, "lab.Session", Tier::Manual, "-> Subject\nsession : int", &adapters).unwrap();
        for name in ["alice", "bob"] {
            db.insert1("lab.Experimenter", Row::from([("experimenter".into(), Value::from(name))])).unwrap();
        }
        db.insert1(
            "lab.Subject",
            Row::from([("subject_id".into(), Value::Integer(1)), ("experimenter".into(), Value::from("alice"))]),
        )
        .unwrap();
        db.insert1(
            "lab.Session",
            Row::from([("subject_id".into(), Value::Integer(1)), ("session".into(), Value::Integer(1))]),
        )
        .unwrap();
        db
    }

    fn session() -> Restriction {
        Restriction::from([("subject_id".into(), Value::Integer(1))])
    }

    #[test]
    fn test_permission_derived_from_parent_owner() {
        let db = setup();
        let config = AppConfig::default();
        let walker = PermissionWalker::new(&db, &config);

        assert!(walker.user_has_permission("lab.Session", &session(), "alice").unwrap());
        assert!(!walker.user_has_permission("lab.Session", &session(), "bob").unwrap());
        assert!(walker.user_has_permission("lab.Session", &session(), "admin").unwrap());
    }

    #[test]
    fn test_dependent_rows_of_other_owners_block_the_owner() {
        let adapters = AdapterRegistry::default();
        let mut db = setup();
        declare(
            &mut db,
            "lab.Note",
            Tier::Manual,
            "note_id : int\n---\n-> Subject\n-> Experimenter",
            &adapters,
        )
        .unwrap();
        let config = AppConfig::default();
        let subject = Restriction::from([("subject_id".into(), Value::Integer(1))]);
        assert!(PermissionWalker::new(&db, &config).user_has_permission("lab.Subject", &subject, "alice").unwrap());

        db.insert1(
            "lab.Note",
            Row::from([
                ("note_id".into(), Value::Integer(1)),
                ("subject_id".into(), Value::Integer(1)),
                ("experimenter".into(), Value::from("bob")),
            ]),
        )
        .unwrap();
        let walker = PermissionWalker::new(&db, &config);
        assert!(!walker.user_has_permission("lab.Subject", &subject, "alice").unwrap());
        assert!(!walker.user_has_permission("lab.Subject", &subject, "bob").unwrap());
        assert!(walker.user_has_permission("lab.Subject", &subject, "admin").unwrap());
    }

    #[test]
    fn test_empty_selection_passes() {
        let db = setup();
        let config = AppConfig::default();
        let restriction = Restriction::from([("subject_id".into(), Value::Integer(99))]);
        assert!(PermissionWalker::new(&db, &config).user_has_permission("lab.Session", &restriction, "bob").unwrap());
    }
}
