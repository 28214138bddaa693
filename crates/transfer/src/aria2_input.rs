//! Reader for aria2c input files (`aria2c -i`).
//!
//! A URI line starts an entry; indented `key=value` lines below it set
//! per-download options. Only the options that decide where a file lands
//! are kept.

use percent_encoding::percent_decode_str;

use crate::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputEntry {
    pub uri: String,
    pub dir: Option<String>,
    pub out: Option<String>,
    pub gid: Option<String>,
}

impl InputEntry {
    /// Path of the download relative to aria2c's base directory.
    ///
    /// `dir` and `out` are joined with `.` and empty segments dropped; the
    /// URI's last path segment stands in for a missing `out`. `None` when
    /// `dir` is absolute or nothing usable is left.
    pub fn relative_path(&self) -> Option<String> {
        if self.dir.as_deref().is_some_and(|d| d.starts_with('/')) {
            return None;
        }
        let name = match &self.out {
            Some(out) => out.clone(),
            None => uri_file_name(&self.uri)?,
        };
        let parts: Vec<&str> = self
            .dir
            .iter()
            .flat_map(|d| d.split('/'))
            .chain(name.split('/'))
            .filter(|p| !p.is_empty() && *p != ".")
            .collect();
        (!parts.is_empty()).then(|| parts.join("/"))
    }
}

fn uri_file_name(uri: &str) -> Option<String> {
    let path = uri.split(['?', '#']).next()?;
    let last = path.rsplit('/').next().filter(|s| !s.is_empty())?;
    percent_decode_str(last)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}

pub fn parse_input(text: &str) -> Result<Vec<InputEntry>, StoreError> {
    let mut entries: Vec<InputEntry> = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if !raw.starts_with([' ', '\t']) {
            // Tab-separated mirrors of the same file; the first one is enough.
            let uri = trimmed.split('\t').next().unwrap_or(trimmed);
            entries.push(InputEntry {
                uri: uri.to_string(),
                ..InputEntry::default()
            });
            continue;
        }

        let Some(entry) = entries.last_mut() else {
            return Err(StoreError::Aria2Input {
                line,
                reason: "option before any URI".into(),
            });
        };
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(StoreError::Aria2Input {
                line,
                reason: format!("expected key=value, got {trimmed:?}"),
            });
        };
        let value = Some(value.trim().to_string());
        match key.trim() {
            "dir" => entry.dir = value,
            "out" => entry.out = value,
            "gid" => entry.gid = value,
            _ => {}
        }
    }
    Ok(entries)
}
