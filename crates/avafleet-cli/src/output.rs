use anyhow::{Context, Result};
use serde::Serialize;
use tabled::Tabled;
use tabled::settings::Style;

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    /// Parse from CLI string argument. Unknown values fall back to a table.
    pub fn from_str_arg(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "yaml" | "yml" => Self::Yaml,
            _ => Self::Table,
        }
    }
}

/// Format rows as a table, JSON array, or YAML sequence.
pub fn format_list<T: Serialize + Tabled>(items: &[T], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Table if items.is_empty() => Ok("(none)".to_string()),
        OutputFormat::Table => Ok(tabled::Table::new(items).with(Style::rounded()).to_string()),
        OutputFormat::Json => serde_json::to_string_pretty(items).context("Failed to render JSON"),
        OutputFormat::Yaml => serde_yaml::to_string(items).context("Failed to render YAML"),
    }
}

pub fn render_list<T: Serialize + Tabled>(items: &[T], format: OutputFormat) -> Result<()> {
    println!("{}", format_list(items, format)?);
    Ok(())
}

pub fn render_one<T: Serialize + Tabled>(item: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => render_list(std::slice::from_ref(item), format),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(item).context("Failed to render JSON")?);
            Ok(())
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(item).context("Failed to render YAML")?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Tabled)]
    struct Row {
        name: String,
        count: u32,
    }

    fn rows() -> Vec<Row> {
        vec![
            Row {
                name: "a".to_string(),
                count: 1,
            },
            Row {
                name: "b".to_string(),
                count: 2,
            },
        ]
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(OutputFormat::from_str_arg("json"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str_arg("YAML"), OutputFormat::Yaml);
        assert_eq!(OutputFormat::from_str_arg("yml"), OutputFormat::Yaml);
        assert_eq!(OutputFormat::from_str_arg("table"), OutputFormat::Table);
        assert_eq!(OutputFormat::from_str_arg("anything"), OutputFormat::Table);
    }

    #[test]
    fn test_format_list_json() {
        let out = format_list(&rows(), OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[1]["name"], "b");
    }

    #[test]
    fn test_format_list_yaml() {
        let out = format_list(&rows(), OutputFormat::Yaml).unwrap();
        assert!(out.contains("name: a"));
        assert!(out.contains("count: 2"));
    }

    #[test]
    fn test_format_list_table() {
        let out = format_list(&rows(), OutputFormat::Table).unwrap();
        assert!(out.contains("name"));
        assert!(out.contains("b"));
    }

    #[test]
    fn test_format_empty_table() {
        let empty: Vec<Row> = Vec::new();
        assert_eq!(format_list(&empty, OutputFormat::Table).unwrap(), "(none)");
    }
}
