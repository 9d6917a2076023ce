//! Conversation grouping and validation.
//!
//! Partitions flat input rows into ordered conversation groups and enforces
//! turn continuity. A defective row or a broken turn sequence invalidates the
//! entire enclosing group; other groups are unaffected.

use crate::cases::CaseRow;
use crate::types::{ConversationGroup, ExtraInputs, TestCase};
use std::collections::HashMap;
use thiserror::Error;

/// Why a group (or an unattributable row) was excluded from execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupDefect {
    #[error("row {row} is missing required field '{field}'")]
    MissingField { row: usize, field: &'static str },
    #[error("row {row} has invalid extra inputs (not a JSON object): {detail}")]
    BadExtraInputs { row: usize, detail: String },
    #[error("duplicate turn number {turn}")]
    DuplicateTurn { turn: u32 },
    #[error("turn numbers must start at 1, found {first}")]
    FirstTurnNotOne { first: u32 },
    #[error("missing turn number {expected} (gap before turn {found})")]
    TurnGap { expected: u32, found: u32 },
}

/// A validation error naming the group it excludes.
///
/// Rows with no usable `group_id` cannot be attributed to any group and are
/// reported individually under a `row:<n>` pseudo group id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub group_id: String,
    pub defect: GroupDefect,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group '{}': {}", self.group_id, self.defect)
    }
}

/// Partition raw rows into validated conversation groups.
///
/// Returns the executable groups in first-seen `group_id` order, each sorted
/// by turn number and contiguous from 1, plus one validation error per
/// excluded group or unattributable row. Validation of one group never aborts
/// validation of the rest.
pub fn group_cases(rows: &[CaseRow]) -> (Vec<ConversationGroup>, Vec<ValidationError>) {
    let mut order: Vec<String> = Vec::new();
    let mut partitions: HashMap<String, Vec<(usize, &CaseRow)>> = HashMap::new();
    let mut errors: Vec<ValidationError> = Vec::new();

    for (index, row) in rows.iter().enumerate() {
        let row_number = index + 1;
        let Some(group_id) = row.group_id.as_deref() else {
            errors.push(ValidationError {
                group_id: format!("row:{row_number}"),
                defect: GroupDefect::MissingField {
                    row: row_number,
                    field: "group_id",
                },
            });
            continue;
        };

        if !partitions.contains_key(group_id) {
            order.push(group_id.to_string());
        }
        partitions
            .entry(group_id.to_string())
            .or_default()
            .push((row_number, row));
    }

    let mut groups = Vec::new();
    for group_id in order {
        let members = partitions.remove(&group_id).unwrap_or_default();
        match build_group(&group_id, &members) {
            Ok(group) => groups.push(group),
            Err(defect) => errors.push(ValidationError { group_id, defect }),
        }
    }

    (groups, errors)
}

/// Validate one partition and produce a group, or the first defect found.
fn build_group(
    group_id: &str,
    members: &[(usize, &CaseRow)],
) -> Result<ConversationGroup, GroupDefect> {
    let mut cases = Vec::with_capacity(members.len());

    for (row_number, row) in members {
        let Some(turn_number) = row.turn_number else {
            return Err(GroupDefect::MissingField {
                row: *row_number,
                field: "turn_number",
            });
        };
        if turn_number == 0 {
            return Err(GroupDefect::MissingField {
                row: *row_number,
                field: "turn_number",
            });
        }
        let Some(user_message) = row.user_message.clone() else {
            return Err(GroupDefect::MissingField {
                row: *row_number,
                field: "user_message",
            });
        };

        let extra_inputs = match &row.extra_inputs {
            None => None,
            Some(raw) => Some(parse_extra_inputs(raw).map_err(|detail| {
                GroupDefect::BadExtraInputs {
                    row: *row_number,
                    detail,
                }
            })?),
        };

        cases.push(TestCase {
            group_id: group_id.to_string(),
            turn_number,
            user_message,
            expected_reply: row.expected_reply.clone(),
            extra_inputs,
        });
    }

    cases.sort_by_key(|c| c.turn_number);

    // Sorted turns must be exactly 1..=N.
    let mut expected = 1u32;
    for case in &cases {
        if case.turn_number == expected {
            expected += 1;
        } else if expected > 1 && case.turn_number == expected - 1 {
            return Err(GroupDefect::DuplicateTurn {
                turn: case.turn_number,
            });
        } else if expected == 1 {
            return Err(GroupDefect::FirstTurnNotOne {
                first: case.turn_number,
            });
        } else {
            return Err(GroupDefect::TurnGap {
                expected,
                found: case.turn_number,
            });
        }
    }

    Ok(ConversationGroup {
        group_id: group_id.to_string(),
        cases,
    })
}

/// Decode the JSON-object-encoded extra inputs string.
fn parse_extra_inputs(raw: &str) -> Result<ExtraInputs, String> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(group: &str, turn: u32, message: &str) -> CaseRow {
        CaseRow {
            group_id: Some(group.to_string()),
            turn_number: Some(turn),
            user_message: Some(message.to_string()),
            expected_reply: None,
            extra_inputs: None,
        }
    }

    #[test]
    fn groups_preserve_first_seen_order() {
        let rows = vec![
            row("b", 1, "b1"),
            row("a", 1, "a1"),
            row("b", 2, "b2"),
            row("a", 2, "a2"),
        ];
        let (groups, errors) = group_cases(&rows);
        assert!(errors.is_empty());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group_id, "b");
        assert_eq!(groups[1].group_id, "a");
    }

    #[test]
    fn out_of_order_turns_are_sorted() {
        let rows = vec![row("g", 3, "m3"), row("g", 1, "m1"), row("g", 2, "m2")];
        let (groups, errors) = group_cases(&rows);
        assert!(errors.is_empty());
        let turns: Vec<u32> = groups[0].cases.iter().map(|c| c.turn_number).collect();
        assert_eq!(turns, vec![1, 2, 3]);
    }

    #[test]
    fn turn_gap_rejects_whole_group() {
        let rows = vec![
            row("bad", 1, "m1"),
            row("bad", 2, "m2"),
            row("bad", 4, "m4"),
            row("good", 1, "m1"),
        ];
        let (groups, errors) = group_cases(&rows);

        // The gapped group produces zero executable cases; the other survives.
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_id, "good");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].group_id, "bad");
        assert_eq!(
            errors[0].defect,
            GroupDefect::TurnGap {
                expected: 3,
                found: 4
            }
        );
    }

    #[test]
    fn duplicate_turn_rejects_group() {
        let rows = vec![row("g", 1, "m1"), row("g", 2, "m2"), row("g", 2, "m2b")];
        let (groups, errors) = group_cases(&rows);
        assert!(groups.is_empty());
        assert_eq!(errors[0].defect, GroupDefect::DuplicateTurn { turn: 2 });
    }

    #[test]
    fn group_not_starting_at_one_is_rejected() {
        let rows = vec![row("g", 2, "m2"), row("g", 3, "m3")];
        let (groups, errors) = group_cases(&rows);
        assert!(groups.is_empty());
        assert_eq!(errors[0].defect, GroupDefect::FirstTurnNotOne { first: 2 });
    }

    #[test]
    fn missing_message_rejects_group_but_not_others() {
        let mut defective = row("g1", 1, "unused");
        defective.user_message = None;
        let rows = vec![defective, row("g1", 2, "m2"), row("g2", 1, "ok")];

        let (groups, errors) = group_cases(&rows);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_id, "g2");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].group_id, "g1");
        assert!(matches!(
            errors[0].defect,
            GroupDefect::MissingField {
                field: "user_message",
                ..
            }
        ));
    }

    #[test]
    fn row_without_group_id_reported_individually() {
        let mut orphan = row("unused", 1, "m1");
        orphan.group_id = None;
        let rows = vec![orphan, row("g", 1, "m1")];

        let (groups, errors) = group_cases(&rows);
        assert_eq!(groups.len(), 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].group_id, "row:1");
    }

    #[test]
    fn extra_inputs_parsed_into_map() {
        let mut r = row("g", 1, "m1");
        r.extra_inputs = Some(r#"{"lang": "en", "n": 2}"#.to_string());
        let (groups, errors) = group_cases(&[r]);
        assert!(errors.is_empty());
        let inputs = groups[0].cases[0].extra_inputs.as_ref().unwrap();
        assert_eq!(inputs.get("lang").unwrap(), "en");
    }

    #[test]
    fn non_object_extra_inputs_rejects_group() {
        let mut r = row("g", 1, "m1");
        r.extra_inputs = Some("[1, 2]".to_string());
        let (groups, errors) = group_cases(&[r]);
        assert!(groups.is_empty());
        assert!(matches!(
            errors[0].defect,
            GroupDefect::BadExtraInputs { .. }
        ));
    }

    #[test]
    fn validation_error_display_names_group_and_defect() {
        let err = ValidationError {
            group_id: "g7".to_string(),
            defect: GroupDefect::TurnGap {
                expected: 2,
                found: 4,
            },
        };
        let text = err.to_string();
        assert!(text.contains("g7"));
        assert!(text.contains("missing turn number 2"));
    }
}
