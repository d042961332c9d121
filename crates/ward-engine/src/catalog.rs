//! Stored scripts and their declared parameters.
//!
//! Catalog scripts are resolved by id when a request names one. Their
//! `param(...)` block is parsed so validation can flag missing mandatory
//! parameters before anything runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, PoisonError, RwLock};

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::comments::mask_comments;
use crate::ScriptCatalog;

/// A script stored in a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    /// Catalog identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Script body.
    pub content: String,
    /// Parameters declared mandatory in the script's `param(...)` block.
    pub required_parameters: Vec<String>,
}

impl ScriptDefinition {
    /// Build a definition, deriving required parameters from the content.
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        let id = id.into();
        let content = content.into();
        Self {
            name: id.clone(),
            required_parameters: parse_script_parameters(&content).mandatory,
            id,
            content,
        }
    }

    /// Override the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Parameters declared by a script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamInfo {
    /// Whether the script has a script-level `param(...)` block.
    pub has_param_block: bool,
    /// Every declared parameter, in declaration order.
    pub declared: Vec<String>,
    /// The subset declared `Mandatory`.
    pub mandatory: Vec<String>,
}

impl ParamInfo {
    /// Case-insensitive membership test, as PowerShell binds names.
    pub fn declares(&self, name: &str) -> bool {
        self.declared.iter().any(|d| d.eq_ignore_ascii_case(name))
    }
}

static PARAM_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bparam\s*\(").expect("param keyword regex"));
static VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("variable regex"));
static MANDATORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bMandatory\b(?:\s*=\s*\$(\w+))?").expect("mandatory regex")
});

/// Parse the script-level `param(...)` block.
///
/// Blocks inside functions are ignored. Comments are skipped.
pub fn parse_script_parameters(content: &str) -> ParamInfo {
    let code = mask_comments(content);
    let Some(body) = script_param_block(&code) else {
        return ParamInfo::default();
    };

    let mut info = ParamInfo {
        has_param_block: true,
        ..ParamInfo::default()
    };
    for segment in split_top_level(body) {
        let (attributes, rest) = split_attributes(segment);
        let Some(name) = VARIABLE.captures(&rest).map(|c| c[1].to_string()) else {
            continue;
        };
        let mandatory = MANDATORY.captures_iter(&attributes).any(|c| {
            c.get(1)
                .is_none_or(|v| !v.as_str().eq_ignore_ascii_case("false"))
        });
        if mandatory {
            info.mandatory.push(name.clone());
        }
        info.declared.push(name);
    }
    info
}

/// Body of the first `param(` found outside any `{ }` block.
fn script_param_block(code: &str) -> Option<&str> {
    for m in PARAM_KEYWORD.find_iter(code) {
        let before = &code[..m.start()];
        let depth = before.matches('{').count() as i64 - before.matches('}').count() as i64;
        if depth != 0 {
            continue;
        }
        let body_start = m.end();
        let mut nesting = 1usize;
        for (offset, c) in code[body_start..].char_indices() {
            match c {
                '(' => nesting += 1,
                ')' => {
                    nesting -= 1;
                    if nesting == 0 {
                        return Some(&code[body_start..body_start + offset]);
                    }
                }
                _ => {}
            }
        }
        return Some(&code[body_start..]);
    }
    None
}

/// Split on commas that are not nested in brackets or quotes.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

/// Separate `[...]` attribute and type groups from the rest of a declaration.
fn split_attributes(segment: &str) -> (String, String) {
    let mut attributes = String::new();
    let mut rest = String::new();
    let mut depth = 0usize;
    for c in segment.chars() {
        match c {
            '[' => {
                depth += 1;
                attributes.push(c);
            }
            ']' if depth > 0 => {
                depth -= 1;
                attributes.push(c);
            }
            _ if depth > 0 => attributes.push(c),
            _ => rest.push(c),
        }
    }
    (attributes, rest)
}

/// A catalog held in memory.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    scripts: RwLock<HashMap<String, ScriptDefinition>>,
}

impl InMemoryCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a script.
    pub fn insert(&self, script: ScriptDefinition) {
        self.scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(script.id.clone(), script);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_script(self, script: ScriptDefinition) -> Self {
        self.insert(script);
        self
    }
}

#[async_trait::async_trait]
impl ScriptCatalog for InMemoryCatalog {
    async fn get_script(&self, script_id: &str) -> anyhow::Result<Option<ScriptDefinition>> {
        Ok(self
            .scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(script_id)
            .cloned())
    }

    async fn list_scripts(&self) -> anyhow::Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Scripts stored as files under a directory; the file stem is the id.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
    extension: String,
}

static SCRIPT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("script id regex"));

impl DirectoryCatalog {
    /// Serve files named `<id>.<extension>` from `root`.
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
        }
    }

    /// The catalog directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, script_id: &str) -> Option<PathBuf> {
        if !SCRIPT_ID.is_match(script_id) || script_id.contains("..") {
            return None;
        }
        Some(self.root.join(format!("{script_id}.{}", self.extension)))
    }
}

#[async_trait::async_trait]
impl ScriptCatalog for DirectoryCatalog {
    async fn get_script(&self, script_id: &str) -> anyhow::Result<Option<ScriptDefinition>> {
        let Some(path) = self.path_for(script_id) else {
            tracing::debug!(script_id, "rejected catalog id");
            return Ok(None);
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(ScriptDefinition::new(script_id, content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read script {}", path.display()))
            }
        }
    }

    async fn list_scripts(&self) -> anyhow::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("failed to list {}", self.root.display()))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let matches_ext = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(self.extension.as_str()));
            if !matches_ext {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if SCRIPT_ID.is_match(stem) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
