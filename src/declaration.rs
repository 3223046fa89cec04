//! Loading declaration documents
//!
//! A document lists `[[resource]]` tables and an optional `[exports]` table:
//!
//! ```toml
//! [[resource]]
//! id = "service"
//! kind = "k8s:core/v1:Service"
//! provider = "k8s"
//!
//! [[resource]]
//! id = "dns"
//! kind = "cloudflare:Record"
//! inputs = { type = "CNAME", value = { "$ref" = "service", output = "hostname" } }
//!
//! [exports]
//! url = { "$concat" = ["https://", { "$ref" = "dns", output = "hostname" }] }
//! ```

use anyhow::{Context, Result, bail};
use reconcile::DeclarationSet;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Document formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    /// Pick a format from the file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            Some(other) => bail!("Unsupported declaration format '.{other}': {}", path.display()),
            None => bail!("Declaration file has no extension: {}", path.display()),
        }
    }
}

/// Parse a declaration document
pub fn parse(content: &str, format: Format) -> Result<DeclarationSet> {
    let declarations = match format {
        Format::Toml => toml::from_str(content).context("Invalid TOML declarations")?,
        Format::Json => serde_json::from_str(content).context("Invalid JSON declarations")?,
    };
    Ok(declarations)
}

/// Load a declaration file, expanding `$VAR` references when `expand_env` is set
pub fn load(path: &Path, expand_env: bool) -> Result<DeclarationSet> {
    let format = Format::from_path(path)?;
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read declarations: {}", path.display()))?;
    let mut declarations = parse(&content, format)
        .with_context(|| format!("Failed to parse declarations: {}", path.display()))?;
    if expand_env {
        expand_with(&mut declarations, |name| std::env::var(name).ok())?;
    }
    log::debug!(
        "Loaded {} resources from {}",
        declarations.len(),
        path.display()
    );
    Ok(declarations)
}

/// Expand `$VAR` / `${VAR}` in every string literal of inputs and exports
///
/// Unset variables are an error; `$$` escapes a literal dollar sign.
pub fn expand_with(
    declarations: &mut DeclarationSet,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let mut expand = |value: &mut Value| -> Result<()> {
        if let Value::String(text) = value
            && text.contains('$')
        {
            let escaped = text.replace("$$", "\u{0}");
            let expanded = shellexpand::env_with_context(&escaped, |name: &str| {
                lookup(name)
                    .map(Some)
                    .ok_or_else(|| format!("environment variable '{name}' is not set"))
            })
            .map_err(|e| anyhow::anyhow!("{}", e.cause))?;
            *text = expanded.replace('\u{0}', "$");
        }
        Ok(())
    };

    for node in &mut declarations.nodes {
        for (name, input) in &mut node.inputs {
            input
                .try_for_each_literal_mut(&mut expand)
                .with_context(|| format!("Failed to expand input '{name}' of '{}'", node.id))?;
        }
    }
    for (name, input) in &mut declarations.exports {
        input
            .try_for_each_literal_mut(&mut expand)
            .with_context(|| format!("Failed to expand export '{name}'"))?;
    }
    Ok(())
}
