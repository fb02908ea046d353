use std::collections::BTreeMap;
use tabled::{settings::Style, Table, Tabled};
use crate::value::Value;

#[derive(Tabled)]
pub struct TableRow {
    #[tabled(rename = "Metric")]
    pub metric: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

#[derive(Tabled)]
struct PropertyRow {
    #[tabled(rename = "Property")]
    property: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Default)]
pub struct TableBuilder {
    rows: Vec<TableRow>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&mut self, label: &str, value: &str) {
        self.rows.push(TableRow {
            metric: label.to_string(),
            value: value.to_string(),
        });
    }

    pub fn build(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }
        Table::new(&self.rows).with(Style::rounded()).to_string()
    }
}

pub fn stats_table(stats: &[(&str, String)]) -> String {
    let mut builder = TableBuilder::new();
    for (label, value) in stats {
        builder.add_row(label, value);
    }
    builder.build()
}

/// Render a node's properties, sorted by name
pub fn properties_table(props: &BTreeMap<String, Value>) -> String {
    if props.is_empty() {
        return String::new();
    }
    let rows: Vec<PropertyRow> = props
        .iter()
        .map(|(property, value)| PropertyRow {
            property: property.clone(),
            kind: match value {
                Value::Reference(_) => "reference".to_string(),
                other => other.column_type().map(|t| t.to_string()).unwrap_or_default(),
            },
            value: value.to_string(),
        })
        .collect();
    Table::new(&rows).with(Style::rounded()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_table_lists_every_property() {
        let mut props = BTreeMap::new();
        props.insert("name".to_string(), Value::from("Alice"));
        props.insert("age".to_string(), Value::from(30));

        let table = properties_table(&props);
        assert!(table.contains("Alice"));
        assert!(table.contains("integer"));
        assert!(table.find("age") < table.find("name"));
    }

    #[test]
    fn test_empty_tables_render_nothing() {
        assert!(properties_table(&BTreeMap::new()).is_empty());
        assert!(TableBuilder::new().build().is_empty());
    }
}
