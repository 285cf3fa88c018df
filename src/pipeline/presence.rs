use anyhow::{Context, Result};
use tracing::warn;

use super::matcher::round_score;
use super::split::SplitOutcome;
use crate::model::{MatchResult, PresenceRow, RosterEntry};

pub const PRESENT: &str = "Present";
pub const ABSENT: &str = "Absent";

#[derive(Debug, Clone, Default)]
pub struct PresenceOutcome {
    pub rows: Vec<PresenceRow>,
    pub warnings: Vec<String>,
}

impl PresenceOutcome {
    pub fn present_count(&self) -> usize {
        self.rows.iter().filter(|row| row.present).count()
    }
}

/// One row per roster entry, in roster order. An entry is present when at
/// least one confident match points at it; duplicates keep the highest
/// score, earliest segment on ties.
pub fn aggregate_presence(
    roster: &[RosterEntry],
    matches: &[MatchResult],
    split: &SplitOutcome,
) -> PresenceOutcome {
    let mut kept: Vec<Option<usize>> = vec![None; roster.len()];
    let mut warnings = Vec::<String>::new();

    for (segment_index, result) in matches.iter().enumerate() {
        if result.uncertain {
            continue;
        }
        let Some(entry_index) = result.matched_entry else {
            continue;
        };
        let Some(slot) = kept.get_mut(entry_index) else {
            continue;
        };

        match *slot {
            None => *slot = Some(segment_index),
            Some(previous) => {
                let previous_score = matches[previous].score;
                let (winner, loser) = if result.score > previous_score {
                    (segment_index, previous)
                } else {
                    (previous, segment_index)
                };
                *slot = Some(winner);

                let message = format!(
                    "roster entry {} matched by segments {} and {}; kept segment {} (score {:.4}), ignored segment {} (score {:.4})",
                    roster[entry_index].external_id,
                    previous,
                    segment_index,
                    winner,
                    round_score(matches[winner].score),
                    loser,
                    round_score(matches[loser].score),
                );
                warn!(external_id = %roster[entry_index].external_id, kept = winner, ignored = loser, "duplicate roster match");
                warnings.push(message);
            }
        }
    }

    let rows = roster
        .iter()
        .zip(kept)
        .map(|(entry, kept)| match kept {
            Some(segment_index) => {
                let result = &matches[segment_index];
                PresenceRow {
                    entry: entry.clone(),
                    present: true,
                    confidence: result.score,
                    segment: Some(result.segment),
                    file_name: split
                        .document_for(segment_index)
                        .map(|document| document.file_name.clone()),
                }
            }
            None => PresenceRow {
                entry: entry.clone(),
                present: false,
                confidence: 0.0,
                segment: None,
                file_name: None,
            },
        })
        .collect();

    PresenceOutcome { rows, warnings }
}

pub fn presence_csv_bytes(rows: &[PresenceRow], extra_columns: &[String]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::<u8>::new());

    let mut header = vec![
        "external_id",
        "display_name",
        "status",
        "confidence",
        "start_page",
        "end_page",
        "file_name",
    ]
    .into_iter()
    .map(str::to_string)
    .collect::<Vec<String>>();
    header.extend(extra_columns.iter().cloned());
    writer
        .write_record(&header)
        .context("failed to write presence header")?;

    for row in rows {
        let mut record = vec![
            row.entry.external_id.clone(),
            row.entry.display_name.clone(),
            if row.present { PRESENT } else { ABSENT }.to_string(),
            format!("{:.4}", round_score(row.confidence)),
            row.segment
                .map(|segment| segment.start_page.to_string())
                .unwrap_or_default(),
            row.segment
                .map(|segment| segment.end_page.to_string())
                .unwrap_or_default(),
            row.file_name.clone().unwrap_or_default(),
        ];
        for column in extra_columns {
            record.push(row.entry.extra_value(column).unwrap_or_default().to_string());
        }
        writer
            .write_record(&record)
            .with_context(|| format!("failed to write presence row {}", row.entry.external_id))?;
    }

    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("failed to finish presence table: {}", err.error()))
}
