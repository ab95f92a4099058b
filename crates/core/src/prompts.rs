//! Prompt template catalog.
//!
//! Templates are opaque parameterized text blobs keyed by name. A built-in
//! catalog ships in the binary; optional custom directories of TOML or YAML
//! files override entries by key. Placeholders use `{name}` syntax with
//! `{{`/`}}` escapes; a template may declare which placeholders are
//! required, otherwise all of them are.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BUILT_IN_CATALOG: &str = include_str!("../prompts/default.toml");

pub type PromptArgs = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(String),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: String, argument: String },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse built-in prompt catalog: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error("failed to parse prompt file `{path}` as TOML: {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse prompt file `{path}` as YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("prompt `{key}` declares required argument `{argument}` with no matching placeholder")]
    InvalidRequired { key: String, argument: String },
}

#[derive(Clone, Debug)]
enum Piece {
    Literal(String),
    Placeholder(String),
}

#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    pieces: Vec<Piece>,
    placeholders: BTreeSet<String>,
    required: BTreeSet<String>,
}

impl PromptTemplate {
    fn from_raw(key: String, raw: RawTemplate) -> Result<Self, PromptError> {
        let (pieces, placeholders) = parse_pieces(&raw.template);
        let required = if raw.required.is_empty() {
            placeholders.clone()
        } else {
            let mut set = BTreeSet::new();
            for argument in raw.required {
                let trimmed = argument.trim().to_string();
                if !placeholders.contains(&trimmed) {
                    return Err(PromptError::InvalidRequired {
                        key,
                        argument: trimmed,
                    });
                }
                set.insert(trimmed);
            }
            set
        };
        Ok(Self {
            key,
            pieces,
            placeholders,
            required,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(String::as_str)
    }

    pub fn render(&self, args: &PromptArgs) -> Result<String, PromptError> {
        for required in &self.required {
            if !args.contains_key(required) {
                return Err(PromptError::MissingArgument {
                    key: self.key.clone(),
                    argument: required.clone(),
                });
            }
        }

        let mut output = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => output.push_str(text),
                Piece::Placeholder(name) => {
                    if let Some(value) = args.get(name) {
                        output.push_str(value);
                    }
                }
            }
        }
        Ok(output)
    }
}

/// Catalog of named prompt templates with directory overrides.
#[derive(Debug)]
pub struct PromptCatalog {
    templates: BTreeMap<String, PromptTemplate>,
}

impl PromptCatalog {
    /// Built-in catalog only.
    pub fn built_in() -> Result<Self, PromptError> {
        Self::with_overrides::<&Path>(&[])
    }

    /// Built-in catalog plus overrides from the given directories, applied
    /// in order. Missing directories are skipped.
    pub fn with_overrides<P: AsRef<Path>>(directories: &[P]) -> Result<Self, PromptError> {
        let mut templates = BTreeMap::new();

        let document: CatalogDocument =
            toml::from_str(BUILT_IN_CATALOG).map_err(PromptError::ParseBuiltIn)?;
        insert_document(&mut templates, document)?;

        for dir in directories {
            load_directory(dir.as_ref(), &mut templates)?;
        }

        Ok(Self { templates })
    }

    pub fn get(&self, key: &str) -> Option<&PromptTemplate> {
        self.templates.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn render(&self, key: &str, args: &PromptArgs) -> Result<String, PromptError> {
        self.get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?
            .render(args)
    }

    pub fn render_with<I, K, V>(&self, key: &str, args: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = PromptArgs::new();
        for (k, v) in args {
            map.insert(k.into(), v.into());
        }
        self.render(key, &map)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    prompts: BTreeMap<String, RawTemplate>,
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    #[serde(alias = "text")]
    template: String,
    #[serde(default)]
    required: Vec<String>,
}

fn insert_document(
    templates: &mut BTreeMap<String, PromptTemplate>,
    document: CatalogDocument,
) -> Result<(), PromptError> {
    for (key, raw) in document.prompts {
        let template = PromptTemplate::from_raw(key.clone(), raw)?;
        templates.insert(key, template);
    }
    Ok(())
}

fn load_directory(
    dir: &Path,
    templates: &mut BTreeMap<String, PromptTemplate>,
) -> Result<(), PromptError> {
    if !dir.is_dir() {
        return Ok(());
    }

    let mut files = Vec::new();
    let entries = fs::read_dir(dir).map_err(|source| PromptError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| PromptError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.path().is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    for path in files {
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            continue;
        };
        let contents = || {
            fs::read_to_string(&path).map_err(|source| PromptError::Io {
                path: path.clone(),
                source,
            })
        };
        match ext.to_ascii_lowercase().as_str() {
            "toml" => {
                let document: CatalogDocument =
                    toml::from_str(&contents()?).map_err(|source| PromptError::ParseToml {
                        path: path.clone(),
                        source,
                    })?;
                insert_document(templates, document)?;
            }
            "yaml" | "yml" => {
                let document: CatalogDocument = serde_yaml::from_str(&contents()?)
                    .map_err(|source| PromptError::ParseYaml {
                        path: path.clone(),
                        source,
                    })?;
                insert_document(templates, document)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_pieces(template: &str) -> (Vec<Piece>, BTreeSet<String>) {
    let mut pieces = Vec::new();
    let mut placeholders = BTreeSet::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    name.push(next);
                }
                let trimmed = name.trim();
                if closed && !trimmed.is_empty() {
                    if !literal.is_empty() {
                        pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                    }
                    placeholders.insert(trimmed.to_string());
                    pieces.push(Piece::Placeholder(trimmed.to_string()));
                } else {
                    // Unterminated or empty brace: keep it literal.
                    literal.push('{');
                    literal.push_str(&name);
                    if closed {
                        literal.push('}');
                    }
                }
            }
            _ => literal.push(ch),
        }
    }
    if !literal.is_empty() {
        pieces.push(Piece::Literal(literal));
    }
    (pieces, placeholders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn built_in_catalog_has_the_engine_keys() {
        let catalog = PromptCatalog::built_in().expect("catalog");
        for key in [
            "extract_base_context",
            "story_elements",
            "outline",
            "critique_outline",
            "revise_outline",
            "chapter_plot",
            "chapter_character",
            "chapter_dialogue",
            "critique_chapter",
            "revise_chapter",
            "judge_complete",
            "finalize_story",
        ] {
            assert!(catalog.get(key).is_some(), "missing prompt `{key}`");
        }
    }

    #[test]
    fn renders_placeholders() {
        let catalog = PromptCatalog::built_in().unwrap();
        let output = catalog
            .render_with(
                "extract_base_context",
                [("initial_prompt", "a tale of two tides")],
            )
            .unwrap();
        assert!(output.contains("a tale of two tides"));
    }

    #[test]
    fn missing_required_argument_fails() {
        let catalog = PromptCatalog::built_in().unwrap();
        let err = catalog
            .render("extract_base_context", &PromptArgs::new())
            .unwrap_err();
        match err {
            PromptError::MissingArgument { argument, .. } => {
                assert_eq!(argument, "initial_prompt");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_key_is_not_found() {
        let catalog = PromptCatalog::built_in().unwrap();
        assert!(matches!(
            catalog.render("no_such_prompt", &PromptArgs::new()),
            Err(PromptError::NotFound(_))
        ));
    }

    #[test]
    fn custom_directory_overrides_by_key() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("override.toml"),
            "[prompts.outline]\ntemplate = \"custom outline for {story_elements}\"\n",
        )
        .unwrap();

        let catalog = PromptCatalog::with_overrides(&[dir.path()]).unwrap();
        let output = catalog
            .render_with("outline", [("story_elements", "the tides")])
            .unwrap();
        assert_eq!(output, "custom outline for the tides");
        // Untouched keys still come from the built-in catalog.
        assert!(catalog.get("chapter_plot").is_some());
    }

    #[test]
    fn yaml_overrides_are_supported() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("extra.yaml"),
            "prompts:\n  judge_complete:\n    template: \"verdict on {draft}?\"\n    required: [draft]\n",
        )
        .unwrap();

        let catalog = PromptCatalog::with_overrides(&[dir.path()]).unwrap();
        let output = catalog
            .render_with("judge_complete", [("draft", "text")])
            .unwrap();
        assert_eq!(output, "verdict on text?");
    }

    #[test]
    fn braces_escape_and_unterminated_braces_stay_literal() {
        let (pieces, placeholders) = parse_pieces("a {{literal}} and {open");
        assert!(placeholders.is_empty());
        let rendered: String = pieces
            .iter()
            .map(|piece| match piece {
                Piece::Literal(text) => text.as_str(),
                Piece::Placeholder(_) => "",
            })
            .collect();
        assert_eq!(rendered, "a {literal} and {open");
    }

    #[test]
    fn declared_required_subset_is_enforced() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("subset.toml"),
            "[prompts.partial]\ntemplate = \"{must} {may}\"\nrequired = [\"must\"]\n",
        )
        .unwrap();
        let catalog = PromptCatalog::with_overrides(&[dir.path()]).unwrap();

        let output = catalog.render_with("partial", [("must", "yes")]).unwrap();
        assert_eq!(output, "yes ");

        assert!(matches!(
            catalog.render("partial", &PromptArgs::new()),
            Err(PromptError::MissingArgument { .. })
        ));
    }

    #[test]
    fn bogus_required_declaration_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("bad.toml"),
            "[prompts.bad]\ntemplate = \"{a}\"\nrequired = [\"zzz\"]\n",
        )
        .unwrap();
        assert!(matches!(
            PromptCatalog::with_overrides(&[dir.path()]),
            Err(PromptError::InvalidRequired { .. })
        ));
    }
}
