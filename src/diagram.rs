//! Entity-relationship diagrams as Graphviz DOT text.

use crate::core::Result;
use crate::schema::SchemaRegistry;
use crate::storage::{Catalog, TableDescriptor, Tier};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

#[derive(Default)]
struct Graph<'c> {
    /// schema -> tables
    clusters: BTreeMap<&'c str, BTreeSet<&'c str>>,
    tiers: BTreeMap<&'c str, Tier>,
    /// parent -> child, dashed when renamed
    edges: BTreeSet<(&'c str, &'c str, bool)>,
}

impl<'c> Graph<'c> {
    fn add_node(&mut self, table: &'c TableDescriptor) {
        self.clusters.entry(table.schema()).or_default().insert(table.name());
        self.tiers.insert(table.name(), table.tier());
    }

    fn render(&self, title: &str) -> String {
        let mut dot = String::new();
        let _ = writeln!(dot, "digraph \"{}\" {{", title);
        let _ = writeln!(dot, "    graph [size=\"12, 12\", rankdir=LR, splines=ortho];");
        let _ = writeln!(dot, "    node [style=filled, shape=note, fontsize=10, fontname=\"Sans-Serif\"];");

        for (schema, tables) in &self.clusters {
            let _ = writeln!(dot, "    subgraph \"cluster_{}\" {{", schema);
            let _ = writeln!(dot, "        color=grey80;");
            let _ = writeln!(dot, "        style=filled;");
            let _ = writeln!(dot, "        label=\"{}\";", schema);
            for table in tables {
                let label = table.rsplit('.').next().unwrap_or(table);
                let tier = self.tiers.get(table).copied().unwrap_or(Tier::Manual);
                let _ = write!(dot, "        \"{}\" [label=\"{}\", fillcolor={}", table, label, fill_color(tier));
                if tier == Tier::Part {
                    let _ = write!(dot, ", fontsize=6");
                }
                let _ = writeln!(dot, "];");
            }
            let _ = writeln!(dot, "    }}");
        }

        for (parent, child, aliased) in &self.edges {
            if *aliased {
                let _ = writeln!(dot, "    \"{}\" -> \"{}\" [style=dashed];", parent, child);
            } else {
                let _ = writeln!(dot, "    \"{}\" -> \"{}\";", parent, child);
            }
        }
        dot.push_str("}\n");
        dot
    }
}

fn fill_color(tier: Tier) -> &'static str {
    match tier {
        Tier::Manual => "green3",
        Tier::Computed => "coral1",
        Tier::Lookup | Tier::Part => "azure3",
        Tier::Imported => "cornflowerblue",
    }
}

/// `table` with the tables it references and the tables referencing it.
pub fn table_diagram(catalog: &Catalog, table: &str) -> Result<String> {
    let root = catalog.get_table(table)?;
    let mut graph = Graph::default();
    graph.add_node(root);

    for fk in catalog.parents(table) {
        graph.add_node(catalog.get_table(&fk.parent)?);
        graph.edges.insert((fk.parent.as_str(), root.name(), fk.aliased));
    }
    for fk in catalog.children(table) {
        graph.add_node(catalog.get_table(&fk.child)?);
        graph.edges.insert((root.name(), fk.child.as_str(), fk.aliased));
    }

    Ok(graph.render(table))
}

/// All registered tables of `schema` (every schema when `None`). With
/// `essential_only`, part tables and lookup tables are left out.
pub fn schema_diagram(registry: &SchemaRegistry, schema: Option<&str>, essential_only: bool) -> Result<String> {
    let catalog = registry.catalog();
    let mut graph = Graph::default();

    let names: Vec<&str> = match schema {
        Some(schema) => registry.tables_in(schema),
        None => registry.table_names().collect(),
    };
    for name in names {
        let table = catalog.get_table(name)?;
        if essential_only && !is_essential(table) {
            continue;
        }
        graph.add_node(table);
    }

    for fk in catalog.foreign_keys() {
        if graph.tiers.contains_key(fk.parent.as_str()) && graph.tiers.contains_key(fk.child.as_str()) {
            graph.edges.insert((fk.parent.as_str(), fk.child.as_str(), fk.aliased));
        }
    }

    Ok(graph.render(schema.unwrap_or("all")))
}

fn is_essential(table: &TableDescriptor) -> bool {
    match table.tier() {
        Tier::Part | Tier::Lookup => false,
        Tier::Manual => !table.is_manual_lookup(),
        Tier::Imported | Tier::Computed => true,
    }
}
