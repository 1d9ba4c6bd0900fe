use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use relup_host::write_atomic;

/// `VERSION_ID` from an os-release file, unquoted.
pub fn read_version_id(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read os-release: {}", path.display()))?;
    parse_version_id(&raw)
        .ok_or_else(|| anyhow!("os-release has no VERSION_ID: {}", path.display()))
}

pub fn parse_version_id(raw: &str) -> Option<String> {
    raw.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("VERSION_ID="))
        .map(|value| value.trim().trim_matches(|ch| ch == '"' || ch == '\'').to_string())
        .filter(|value| !value.is_empty())
}

/// Makes `do-release-upgrade` offer LTS releases only. Returns whether the
/// file changed.
pub fn force_lts_prompt(path: &Path) -> Result<bool> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read release-upgrades policy: {}", path.display())
            });
        }
    };

    let updated = with_lts_prompt(&raw);
    if updated == raw {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    write_atomic(path, updated.as_bytes(), 0o644).with_context(|| {
        format!(
            "failed to write release-upgrades policy: {}",
            path.display()
        )
    })?;
    Ok(true)
}

pub fn with_lts_prompt(raw: &str) -> String {
    let mut saw_prompt = false;
    let mut lines = raw
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("Prompt=") {
                saw_prompt = true;
                "Prompt=lts".to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>();

    if !saw_prompt {
        if !lines.iter().any(|line| line.trim() == "[DEFAULT]") {
            lines.push("[DEFAULT]".to_string());
        }
        let insert_at = lines
            .iter()
            .position(|line| line.trim() == "[DEFAULT]")
            .map_or(lines.len(), |index| index + 1);
        lines.insert(insert_at, "Prompt=lts".to_string());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
