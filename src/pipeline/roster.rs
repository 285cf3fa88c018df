use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{info, warn};

use crate::model::{Roster, RosterEntry};

const ID_ALIASES: &[&str] = &[
    "external_id",
    "student_id",
    "id",
    "reg_no",
    "regno",
    "registration_number",
    "roll_no",
];

const NAME_ALIASES: &[&str] = &[
    "display_name",
    "student_name",
    "name",
    "full_name",
    "student",
];

fn header_key(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .chars()
        .map(|character| {
            if character.is_whitespace() || character == '-' || character == '.' {
                '_'
            } else {
                character
            }
        })
        .collect()
}

fn find_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    aliases.iter().find_map(|alias| {
        headers
            .iter()
            .position(|header| header_key(header) == *alias)
    })
}

/// Loads the roster from CSV (header aliasing, first two columns as a
/// fallback) or from a JSON array of objects when the extension is `.json`.
pub fn load_roster(path: &Path) -> Result<Roster> {
    if !path.is_file() {
        bail!("roster not found: {}", path.display());
    }

    let is_json = path
        .extension()
        .and_then(|value| value.to_str())
        .is_some_and(|value| value.eq_ignore_ascii_case("json"));

    let roster = if is_json {
        load_json_roster(path)?
    } else {
        load_csv_roster(path)?
    };

    info!(
        roster = %path.display(),
        entries = roster.entries.len(),
        extra_columns = roster.extra_columns.len(),
        "roster loaded"
    );
    Ok(roster)
}

fn load_csv_roster(path: &Path) -> Result<Roster> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open roster {}", path.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("failed to read roster header {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect::<Vec<String>>();

    let (id_column, name_column) = match (
        find_column(&headers, ID_ALIASES),
        find_column(&headers, NAME_ALIASES),
    ) {
        (Some(id), Some(name)) if id != name => (id, name),
        _ if headers.len() >= 2 => {
            warn!(
                roster = %path.display(),
                "roster header has no recognised id/name columns; using the first two columns"
            );
            (0, 1)
        }
        _ => bail!(
            "roster {} has no usable id and name columns (header: {})",
            path.display(),
            headers.join(",")
        ),
    };

    let extra_columns = headers
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != id_column && *index != name_column)
        .map(|(_, header)| header.clone())
        .collect::<Vec<String>>();

    let mut entries = Vec::<RosterEntry>::new();
    let mut skipped = 0_usize;
    for (row_index, record) in reader.records().enumerate() {
        let record = record.with_context(|| {
            format!("failed to read roster row {} in {}", row_index + 2, path.display())
        })?;

        let external_id = record.get(id_column).unwrap_or_default().to_string();
        let display_name = record.get(name_column).unwrap_or_default().to_string();
        if external_id.is_empty() && display_name.is_empty() {
            skipped += 1;
            continue;
        }

        let extra = headers
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != id_column && *index != name_column)
            .map(|(index, header)| {
                (
                    header.clone(),
                    record.get(index).unwrap_or_default().to_string(),
                )
            })
            .collect();

        let mut entry = RosterEntry::new(&external_id, &display_name);
        entry.extra = extra;
        entries.push(entry);
    }

    if skipped > 0 {
        warn!(roster = %path.display(), skipped, "skipped roster rows without id or name");
    }

    Ok(Roster {
        entries,
        extra_columns,
    })
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn load_json_roster(path: &Path) -> Result<Roster> {
    let raw = fs::read(path).with_context(|| format!("failed to read roster {}", path.display()))?;
    let value = serde_json::from_slice::<Value>(&raw)
        .with_context(|| format!("failed to parse roster {}", path.display()))?;
    let Some(items) = value.as_array() else {
        bail!("roster {} must be a JSON array of objects", path.display());
    };

    let mut extra_columns = Vec::<String>::new();
    let mut entries = Vec::<RosterEntry>::new();

    for (index, item) in items.iter().enumerate() {
        let Some(object) = item.as_object() else {
            bail!("roster {} entry {index} is not an object", path.display());
        };

        let keys = object.keys().cloned().collect::<Vec<String>>();
        let id_key = find_column(&keys, ID_ALIASES).map(|position| keys[position].clone());
        let name_key = find_column(&keys, NAME_ALIASES).map(|position| keys[position].clone());
        if id_key.is_none() && name_key.is_none() {
            bail!(
                "roster {} entry {index} has no id or name field",
                path.display()
            );
        }

        let external_id = id_key
            .as_ref()
            .and_then(|key| object.get(key))
            .map(json_text)
            .unwrap_or_default();
        let display_name = name_key
            .as_ref()
            .and_then(|key| object.get(key))
            .map(json_text)
            .unwrap_or_default();

        let mut extra = Vec::<(String, String)>::new();
        for (key, value) in object {
            if Some(key) == id_key.as_ref() || Some(key) == name_key.as_ref() {
                continue;
            }
            if !extra_columns.contains(key) {
                extra_columns.push(key.clone());
            }
            extra.push((key.clone(), json_text(value)));
        }

        entries.push(RosterEntry {
            external_id,
            display_name,
            extra,
        });
    }

    Ok(Roster {
        entries,
        extra_columns,
    })
}
