//! Named prompt templates.
//!
//! Templates support `{{field}}` substitution (dotted paths reach into nested
//! objects) and `{{#if field}}...{{/if}}` sections, rendered against any
//! `Serialize` value. A section is kept when its field is present and is not
//! `null`, `false`, `""`, `0`, `[]` or `{}`.

use std::collections::HashMap;
use std::fmt::Display;

use serde::Serialize;
use serde_json::Value;

use crate::Error;

pub const FILE_NAMING: &str = "file_naming";
pub const CONTENT_CLASSIFICATION: &str = "content_classification";
pub const MEDIA_EXTRACTION: &str = "media_extraction";

/// Infers media metadata from a file name.
pub const FILE_NAMING_TEMPLATE: &str = r#"You are an assistant that names film and TV files. Analyse the file name below and infer the correct media information.

Original file name: {{file_name}}
{{#if file_path}}Path: {{file_path}}{{/if}}

Output JSON in this shape:
{
  "media_type": "tv or movie",
  "title": "title (English preferred)",
  "title_cn": "Chinese title",
  "year": year,
  "season": season number (TV only, null for movies),
  "episode": episode number (TV only, null for movies),
  "confidence": confidence score between 0.0 and 1.0
}

Rules:
1. Prefer the English title; keep the Chinese title if it is the only one
2. Extract year, season and episode accurately
3. Drop quality markers such as 1080p, WEB-DL or BluRay
4. If the information is unclear, set confidence low (< 0.5)
5. The response must be valid JSON"#;

/// Classifies free-form content.
pub const CONTENT_CLASSIFICATION_TEMPLATE: &str = r#"You are a content classification expert. Classify the following content.

Content: {{content}}

Analyse the type, topic and sentiment of the content and output JSON in this shape:
{
  "category": "category",
  "subcategory": "subcategory",
  "tags": ["tag1", "tag2"],
  "sentiment": "positive/negative/neutral",
  "confidence": 0.0-1.0
}"#;

/// Extracts detailed release information for a media file.
pub const MEDIA_EXTRACTION_TEMPLATE: &str = r#"You are an expert at extracting film and TV metadata. Extract detailed media information from the input below.

File name: {{file_name}}
{{#if context}}Context: {{context}}{{/if}}

Output JSON in this shape:
{
  "title": "title",
  "title_original": "original title",
  "year": year,
  "media_type": "movie/tv/documentary/anime",
  "season": season number (for series),
  "episode": episode number (for series),
  "quality": "video quality, e.g. 1080p or 4K",
  "source": "source, e.g. BluRay or WEB-DL",
  "codec": "codec, e.g. x264 or HEVC",
  "audio": "audio information",
  "language": "language",
  "subtitles": ["subtitle languages"],
  "release_group": "release group",
  "confidence": 0.0-1.0
}

Rules:
1. Extract as much information as possible
2. Return null for fields you are unsure about
3. confidence reflects how reliable the extracted information is
4. The response must be valid JSON"#;

/// Input for [`FILE_NAMING_TEMPLATE`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileNamingData {
    pub file_name: String,
    pub file_path: Option<String>,
}

/// Input for [`MEDIA_EXTRACTION_TEMPLATE`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaExtractionData {
    pub file_name: String,
    pub context: Option<String>,
}

/// Input for [`CONTENT_CLASSIFICATION_TEMPLATE`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContentClassificationData {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Field(Vec<String>),
    If { path: Vec<String>, body: Vec<Node> },
}

/// A parsed template.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    source: String,
    nodes: Vec<Node>,
}

impl Template {
    /// Parse `source`, failing on unbalanced or malformed tags.
    pub fn parse(name: impl Into<String>, source: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let source = source.into();
        let nodes = parse_nodes(&name, &source)?;
        Ok(Self {
            name,
            source,
            nodes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render against `data`. A `{{field}}` that does not resolve is an error.
    pub fn render<T: Serialize + ?Sized>(&self, data: &T) -> Result<String, Error> {
        let value = serde_json::to_value(data).map_err(|e| {
            Error::template(format!("cannot render template '{}': {e}", self.name))
        })?;
        let mut out = String::with_capacity(self.source.len());
        render_nodes(&self.name, &self.nodes, &value, &mut out)?;
        Ok(out)
    }
}

fn parse_nodes(name: &str, source: &str) -> Result<Vec<Node>, Error> {
    // Open sections: condition plus the nodes collected before it opened.
    let mut open: Vec<(Vec<String>, Vec<Node>)> = Vec::new();
    let mut nodes = Vec::new();
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            nodes.push(Node::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::template(format!("unclosed tag in template '{name}'")))?;
        let tag = after[..end].trim();
        rest = &after[end + 2..];

        if let Some(condition) = tag.strip_prefix("#if") {
            if !condition.starts_with(char::is_whitespace) {
                return Err(Error::template(format!(
                    "malformed tag '{{{{{tag}}}}}' in template '{name}'"
                )));
            }
            let path = parse_path(name, condition.trim())?;
            open.push((path, std::mem::take(&mut nodes)));
        } else if tag == "/if" {
            let (path, parent) = open.pop().ok_or_else(|| {
                Error::template(format!("unexpected {{{{/if}}}} in template '{name}'"))
            })?;
            let body = std::mem::replace(&mut nodes, parent);
            nodes.push(Node::If { path, body });
        } else {
            nodes.push(Node::Field(parse_path(name, tag)?));
        }
    }

    if !rest.is_empty() {
        nodes.push(Node::Text(rest.to_string()));
    }
    if !open.is_empty() {
        return Err(Error::template(format!(
            "unclosed {{{{#if}}}} in template '{name}'"
        )));
    }
    Ok(nodes)
}

fn parse_path(name: &str, expr: &str) -> Result<Vec<String>, Error> {
    let expr = expr.strip_prefix('.').unwrap_or(expr);
    let valid_segment =
        |s: &str| !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_');

    if expr.is_empty() || !expr.split('.').all(valid_segment) {
        return Err(Error::template(format!(
            "invalid field '{expr}' in template '{name}'"
        )));
    }
    Ok(expr.split('.').map(str::to_string).collect())
}

fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| current.get(segment))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn render_nodes(name: &str, nodes: &[Node], data: &Value, out: &mut String) -> Result<(), Error> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Field(path) => match lookup(data, path) {
                Some(Value::Null) => {}
                Some(Value::String(s)) => out.push_str(s),
                Some(other) => out.push_str(&other.to_string()),
                None => {
                    return Err(Error::template(format!(
                        "missing field '{}' in template '{name}'",
                        path.join(".")
                    )))
                }
            },
            Node::If { path, body } => {
                if lookup(data, path).is_some_and(is_truthy) {
                    render_nodes(name, body, data, out)?;
                }
            }
        }
    }
    Ok(())
}

/// Registry of named templates, preloaded with the built-in ones.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    templates: HashMap<String, Template>,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptBuilder {
    pub fn new() -> Self {
        let mut builder = Self::empty();
        for (name, source) in [
            (FILE_NAMING, FILE_NAMING_TEMPLATE),
            (CONTENT_CLASSIFICATION, CONTENT_CLASSIFICATION_TEMPLATE),
            (MEDIA_EXTRACTION, MEDIA_EXTRACTION_TEMPLATE),
        ] {
            if let Err(e) = builder.register_template(name, source) {
                tracing::error!(template = name, error = %e, "failed to register built-in template");
            }
        }
        builder
    }

    /// A registry without the built-in templates.
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Parse and store a template, replacing any previous one with that name.
    pub fn register_template(&mut self, name: &str, source: &str) -> Result<(), Error> {
        let template = Template::parse(name, source)?;
        self.templates.insert(name.to_string(), template);
        Ok(())
    }

    /// Render the template registered as `name`.
    pub fn build<T: Serialize + ?Sized>(&self, name: &str, data: &T) -> Result<String, Error> {
        self.templates
            .get(name)
            .ok_or_else(|| Error::template(format!("template '{name}' does not exist")))?
            .render(data)
    }

    /// Replace each `{}` in `format` with the next argument. Placeholders
    /// without an argument are left as they are.
    pub fn build_simple(&self, format: &str, args: &[&dyn Display]) -> String {
        let mut out = String::with_capacity(format.len());
        let mut args = args.iter();
        let mut pieces = format.split("{}").peekable();
        while let Some(piece) = pieces.next() {
            out.push_str(piece);
            if pieces.peek().is_some() {
                match args.next() {
                    Some(arg) => out.push_str(&arg.to_string()),
                    None => out.push_str("{}"),
                }
            }
        }
        out
    }

    pub fn get_template(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn template_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
