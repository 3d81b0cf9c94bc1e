//! TOML parsing with line context in errors

use std::path::Path;

use anyhow::{Context, Result};

use super::schema::StagehandConfig;

/// Parse and validate a stagehand.toml file.
pub fn parse_stagehand_toml(path: &Path) -> Result<StagehandConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_stagehand_toml_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse and validate stagehand.toml content.
pub fn parse_stagehand_toml_str(content: &str) -> Result<StagehandConfig> {
    let config: StagehandConfig =
        toml::from_str(content).map_err(|e| enhance_toml_error(&e, content))?;
    config.validate()?;
    Ok(config)
}

/// Serialize a configuration to TOML.
pub fn to_toml(config: &StagehandConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize configuration to TOML")
}

fn enhance_toml_error(error: &toml::de::Error, content: &str) -> anyhow::Error {
    let message = error.message();
    match error.span() {
        Some(span) => {
            let line = content[..span.start.min(content.len())]
                .bytes()
                .filter(|b| *b == b'\n')
                .count()
                + 1;
            anyhow::anyhow!(
                "TOML parsing error at line {}:\n{}\n\nError: {}",
                line,
                line_context(content, line),
                message
            )
        }
        None => anyhow::anyhow!("TOML parsing error: {}", message),
    }
}

fn line_context(content: &str, line: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = line.saturating_sub(2);
    let end = (line + 1).min(lines.len());

    lines
        .get(start..end)
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let num = start + i + 1;
            let marker = if num == line { ">>>" } else { "   " };
            format!("{} {:4} | {}", marker, num, text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
