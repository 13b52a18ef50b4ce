use ago_core::{AgoError, AgoResult};
use serde::{Deserialize, Serialize};
use serde_yaml_ng::Value;
use std::path::Path;

pub const TEMPLATE_EXTENSION: &str = "agt";

/// A named, versioned, declarative agent specification loaded from a
/// `<name>.agt` YAML file. Immutable once loaded; `version` is surfaced
/// but never consulted during resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: Option<String>,
    pub model: Option<String>,
    pub temperature: f32,
    pub tools: Vec<String>,
    pub prompt: String,
    pub metadata: Option<Value>,
}

impl Template {
    /// Parse a template file, naming the offending field on failure.
    pub fn load(path: &Path) -> AgoResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let name_hint = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("<unknown>")
            .to_string();
        Self::parse(&raw, &name_hint)
    }

    pub fn parse(raw: &str, name_hint: &str) -> AgoResult<Self> {
        let doc: Value = serde_yaml_ng::from_str(raw).map_err(|e| AgoError::BadTemplate {
            name: name_hint.to_string(),
            field: "<document>".to_string(),
            problem: e.to_string(),
        })?;

        let Value::Mapping(_) = &doc else {
            return Err(AgoError::BadTemplate {
                name: name_hint.to_string(),
                field: "<document>".to_string(),
                problem: "is not a mapping".to_string(),
            });
        };

        let name = required_string(&doc, name_hint, "name")?;
        let prompt = required_string(&doc, name_hint, "prompt")?;
        let version = optional_string(&doc, name_hint, "version")?.unwrap_or_else(|| "1.0".into());
        let description = optional_string(&doc, name_hint, "description")?.unwrap_or_default();
        let author = optional_string(&doc, name_hint, "author")?;
        let model = optional_string(&doc, name_hint, "model")?;

        let temperature = match doc.get("temperature") {
            None | Some(Value::Null) => 0.7,
            Some(v) => v.as_f64().map(|f| f as f32).ok_or_else(|| AgoError::BadTemplate {
                name: name_hint.to_string(),
                field: "temperature".to_string(),
                problem: "must be a number".to_string(),
            })?,
        };

        let tools = match doc.get("tools") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Sequence(seq)) => {
                let mut tools = Vec::with_capacity(seq.len());
                for item in seq {
                    match item.as_str() {
                        Some(tool) => tools.push(tool.to_string()),
                        None => {
                            return Err(AgoError::BadTemplate {
                                name: name_hint.to_string(),
                                field: "tools".to_string(),
                                problem: "entries must be strings".to_string(),
                            })
                        }
                    }
                }
                tools
            }
            Some(_) => {
                return Err(AgoError::BadTemplate {
                    name: name_hint.to_string(),
                    field: "tools".to_string(),
                    problem: "must be a list of names".to_string(),
                })
            }
        };

        let metadata = doc.get("metadata").cloned().filter(|v| !v.is_null());

        Ok(Self {
            name,
            version,
            description,
            author,
            model,
            temperature,
            tools,
            prompt,
            metadata,
        })
    }
}

fn required_string(doc: &Value, name_hint: &str, field: &str) -> AgoResult<String> {
    match doc.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(AgoError::BadTemplate {
            name: name_hint.to_string(),
            field: field.to_string(),
            problem: "must not be empty".to_string(),
        }),
        Some(_) => Err(AgoError::BadTemplate {
            name: name_hint.to_string(),
            field: field.to_string(),
            problem: "must be a string".to_string(),
        }),
        None => Err(AgoError::BadTemplate {
            name: name_hint.to_string(),
            field: field.to_string(),
            problem: "is missing".to_string(),
        }),
    }
}

fn optional_string(doc: &Value, name_hint: &str, field: &str) -> AgoResult<Option<String>> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(AgoError::BadTemplate {
            name: name_hint.to_string(),
            field: field.to_string(),
            problem: "must be a string".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESEARCHER: &str = r#"
name: researcher
version: "1.0"
description: Information gathering and analysis specialist
author: Ago Built-in Templates
model: claude-3-5-sonnet-20241022
temperature: 0.7
tools:
  - web_search
  - file_manager
prompt: |
  You are a research specialist.
  Be methodical and cite your sources.
metadata:
  category: builtin
"#;

    #[test]
    fn test_parse_full_template() {
        let t = Template::parse(RESEARCHER, "researcher").unwrap();
        assert_eq!(t.name, "researcher");
        assert_eq!(t.version, "1.0");
        assert_eq!(t.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
        assert_eq!(t.tools, vec!["web_search", "file_manager"]);
        assert!(t.prompt.contains("research specialist"));
        assert!(t.metadata.is_some());
    }

    #[test]
    fn test_missing_name_names_the_field() {
        let err = Template::parse("prompt: hi\n", "broken").unwrap_err();
        match err {
            AgoError::BadTemplate { field, .. } => assert_eq!(field, "name"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_prompt_names_the_field() {
        let err = Template::parse("name: x\n", "x").unwrap_err();
        match err {
            AgoError::BadTemplate { field, .. } => assert_eq!(field, "prompt"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_wrong_type_names_the_field() {
        let err = Template::parse("name: x\nprompt: hi\ntools: not-a-list\n", "x").unwrap_err();
        match err {
            AgoError::BadTemplate { field, .. } => assert_eq!(field, "tools"),
            other => panic!("unexpected error: {other:?}"),
        }

        let err = Template::parse("name: x\nprompt: hi\ntemperature: warm\n", "x").unwrap_err();
        match err {
            AgoError::BadTemplate { field, .. } => assert_eq!(field, "temperature"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_defaults_for_optional_fields() {
        let t = Template::parse("name: min\nprompt: hello\n", "min").unwrap();
        assert_eq!(t.version, "1.0");
        assert_eq!(t.description, "");
        assert!(t.author.is_none());
        assert!(t.model.is_none());
        assert!((t.temperature - 0.7).abs() < f32::EPSILON);
        assert!(t.tools.is_empty());
        assert!(t.metadata.is_none());
    }

    #[test]
    fn test_not_a_mapping() {
        let err = Template::parse("- just\n- a\n- list\n", "weird").unwrap_err();
        match err {
            AgoError::BadTemplate { field, .. } => assert_eq!(field, "<document>"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
