//! Cell-level checks against the item definitions, and the aggregates built
//! from them: per-column summaries and per-subject completeness.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info};

use crate::classify::ColumnClassification;
use crate::config::{InputTable, Issue, IssueCode, ItemRef, RunParameters};
use crate::library::TemplateLibrary;
use crate::sessions::SessionResolution;
use crate::template::Item;

/// The value written for a missing cell.
pub const MISSING_VALUE: &str = "n/a";

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum CellStatus {
    Ok,
    Missing,
    UnexpectedValue,
    OutOfRange,
}

/// The outcome of checking one raw value.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CheckedValue {
    /// The value to write: the level key for levels, `n/a` for missing cells,
    /// the trimmed raw value otherwise.
    pub value: String,
    pub status: CellStatus,
}

/// One `(subject, session, run, item)` value of the output.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ResponseCell {
    pub subject: String,
    pub session: String,
    pub run: Option<u32>,
    pub item: ItemRef,
    pub raw_id: String,
    /// 0-based data row.
    pub row_index: usize,
    pub raw_column: String,
    pub raw: String,
    pub value: String,
    pub status: CellStatus,
    /// Carried for scoring; the value itself is not transformed.
    pub reversed: bool,
}

/// Missing and non-missing cells of one subject/session.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub struct Completeness {
    pub cells: usize,
    pub answered: usize,
}

impl Completeness {
    pub fn ratio(&self) -> f64 {
        if self.cells == 0 {
            0.0
        } else {
            self.answered as f64 / self.cells as f64
        }
    }
}

#[derive(PartialEq, Debug, Clone, Default)]
pub struct ValidationResult {
    /// In row order, then column order.
    pub cells: Vec<ResponseCell>,
    /// Per mapping (same order as the classification): percentage of missing
    /// cells.
    pub missing_pct: Vec<f64>,
    pub completeness: BTreeMap<(String, String), Completeness>,
}

/// Percentages are reported with one decimal.
pub fn percent(ratio: f64) -> f64 {
    (ratio * 1000.0).round() / 10.0
}

/// Matches a raw value against declared levels: the key itself, a number
/// equal to a numeric key (`"1.0"` is `"1"`), or a label. Returns the key.
pub fn normalize_level(value: &str, levels: &[(String, String)]) -> Option<String> {
    let v = value.trim();
    if let Some((k, _)) = levels.iter().find(|(k, _)| k.trim() == v) {
        return Some(k.clone());
    }
    if let Ok(x) = v.parse::<f64>() {
        let numeric = levels
            .iter()
            .find(|(k, _)| k.trim().parse::<f64>().map(|y| y == x).unwrap_or(false));
        if let Some((k, _)) = numeric {
            return Some(k.clone());
        }
    }
    let lv = v.to_lowercase();
    levels
        .iter()
        .find(|(_, label)| !label.is_empty() && label.trim().to_lowercase() == lv)
        .map(|(k, _)| k.clone())
}

/// Checks one raw value against an item.
pub fn check_value(item: &Item, raw: &str, params: &RunParameters) -> CheckedValue {
    let v = raw.trim();
    if params.is_missing_token(v) {
        return CheckedValue {
            value: MISSING_VALUE.to_string(),
            status: CellStatus::Missing,
        };
    }
    if let Some(levels) = item.levels.as_ref() {
        return match normalize_level(v, levels) {
            Some(k) => CheckedValue {
                value: k,
                status: CellStatus::Ok,
            },
            None => CheckedValue {
                value: v.to_string(),
                status: CellStatus::UnexpectedValue,
            },
        };
    }
    if item.min.is_some() || item.max.is_some() {
        let in_bounds = match v.parse::<f64>() {
            Ok(x) => {
                !x.is_nan()
                    && item.min.map(|lo| x >= lo).unwrap_or(true)
                    && item.max.map(|hi| x <= hi).unwrap_or(true)
            }
            Err(_) => false,
        };
        let status = if in_bounds {
            CellStatus::Ok
        } else {
            CellStatus::OutOfRange
        };
        return CheckedValue {
            value: v.to_string(),
            status,
        };
    }
    CheckedValue {
        value: v.to_string(),
        status: CellStatus::Ok,
    }
}

/// The only template problem found at validation time: an item whose levels
/// and bounds contradict each other. Checked for the matched items only.
pub fn check_item_definitions(
    classification: &ColumnClassification,
    library: &TemplateLibrary,
) -> Vec<Issue> {
    let items: BTreeSet<&ItemRef> = classification.mappings.iter().map(|m| &m.item).collect();
    items
        .into_iter()
        .filter_map(|r| {
            let reason = library.item(r)?.bounds_conflict()?;
            Some(
                Issue::error(
                    IssueCode::LevelsBoundsConflict,
                    format!("item {}: {}", r, reason),
                )
                .item(r),
            )
        })
        .collect()
}

// Offending values of one column.
#[derive(Default)]
struct Offenders {
    count: usize,
    samples: Vec<String>,
}

impl Offenders {
    fn add(&mut self, value: &str, limit: usize) {
        self.count += 1;
        if self.samples.len() < limit && !self.samples.iter().any(|s| s == value) {
            self.samples.push(value.to_string());
        }
    }
}

/// Validates every retained row against the matched items.
///
/// With `strict_levels`, unexpected values are flagged as `strict` in their
/// issue context; they stay warnings. Fails only on contradictory item
/// definitions.
pub fn validate_rows(
    table: &InputTable,
    classification: &ColumnClassification,
    resolution: &SessionResolution,
    library: &TemplateLibrary,
    params: &RunParameters,
    strict_levels: bool,
    issues: &mut Vec<Issue>,
) -> Result<ValidationResult, Vec<Issue>> {
    let fatal = check_item_definitions(classification, library);
    if !fatal.is_empty() {
        return Err(fatal);
    }

    let mut res = ValidationResult::default();
    let mut owners: HashMap<(String, String, Option<u32>, ItemRef), String> = HashMap::new();
    let mut missing_per_column: Vec<usize> = vec![0; classification.mappings.len()];
    let mut unexpected: Vec<Offenders> = Vec::new();
    let mut out_of_range: Vec<Offenders> = Vec::new();
    for _ in classification.mappings.iter() {
        unexpected.push(Offenders::default());
        out_of_range.push(Offenders::default());
    }

    for row in resolution.rows.iter() {
        let cells = match table.rows.get(row.row_index) {
            Some(c) => c,
            None => continue,
        };
        for (m_idx, m) in classification.mappings.iter().enumerate() {
            let item = match library.item(&m.item) {
                Some(i) => i,
                None => continue,
            };
            let raw = cells.get(m.column_index).map(|s| s.as_str()).unwrap_or("");
            let checked = check_value(item, raw, params);

            // The column suffix wins over the row, the row over the defaults.
            let session = if m.session_explicit {
                m.session.clone()
            } else {
                row.session.clone().unwrap_or_else(|| m.session.clone())
            };
            let key = (row.subject.clone(), session.clone(), m.run, m.item.clone());
            if let Some(first) = owners.get(&key) {
                issues.push(
                    Issue::error(
                        IssueCode::CellConflict,
                        format!(
                            "{} {}: {} already has a value from column {}, column {} ignored",
                            row.subject, session, m.item, first, m.raw_column
                        ),
                    )
                    .column(&m.raw_column)
                    .item(&m.item)
                    .subject(&row.subject)
                    .session(&session)
                    .row(row.row_index + 1),
                );
                continue;
            }
            owners.insert(key, m.raw_column.clone());

            match checked.status {
                CellStatus::Missing => missing_per_column[m_idx] += 1,
                CellStatus::UnexpectedValue => {
                    unexpected[m_idx].add(&checked.value, params.value_sample_limit)
                }
                CellStatus::OutOfRange => {
                    out_of_range[m_idx].add(&checked.value, params.value_sample_limit)
                }
                CellStatus::Ok => {}
            }
            let c = res
                .completeness
                .entry((row.subject.clone(), session.clone()))
                .or_default();
            c.cells += 1;
            if checked.status != CellStatus::Missing {
                c.answered += 1;
            }

            res.cells.push(ResponseCell {
                subject: row.subject.clone(),
                session,
                run: m.run,
                item: m.item.clone(),
                raw_id: row.raw_id.clone(),
                row_index: row.row_index,
                raw_column: m.raw_column.clone(),
                raw: raw.to_string(),
                value: checked.value,
                status: checked.status,
                reversed: item.reversed,
            });
        }
    }

    let rows = resolution.rows.len();
    for (m_idx, m) in classification.mappings.iter().enumerate() {
        res.missing_pct.push(if rows == 0 {
            0.0
        } else {
            percent(missing_per_column[m_idx] as f64 / rows as f64)
        });
        let u = &unexpected[m_idx];
        if u.count > 0 {
            issues.push(
                Issue::warning(
                    IssueCode::UnexpectedValue,
                    format!(
                        "column {}: {} value(s) are not levels of {}: {}",
                        m.raw_column,
                        u.count,
                        m.item,
                        u.samples.join(", ")
                    ),
                )
                .column(&m.raw_column)
                .item(&m.item)
                .count(u.count)
                .values(u.samples.clone())
                .strict(strict_levels),
            );
        }
        let o = &out_of_range[m_idx];
        if o.count > 0 {
            issues.push(
                Issue::warning(
                    IssueCode::OutOfRange,
                    format!(
                        "column {}: {} value(s) outside the bounds of {}: {}",
                        m.raw_column,
                        o.count,
                        m.item,
                        o.samples.join(", ")
                    ),
                )
                .column(&m.raw_column)
                .item(&m.item)
                .count(o.count)
                .values(o.samples.clone()),
            );
        }
    }

    for ((subject, session), c) in res.completeness.iter() {
        let missing = 1.0 - c.ratio();
        if c.cells > 0 && missing > params.missingness_threshold {
            debug!(
                "validate_rows: {} {}: {} of {} cells missing",
                subject,
                session,
                c.cells - c.answered,
                c.cells
            );
            issues.push(
                Issue::warning(
                    IssueCode::HighMissingness,
                    format!(
                        "{} {}: {}% of the answers are missing",
                        subject,
                        session,
                        percent(missing)
                    ),
                )
                .subject(subject)
                .session(session)
                .count(c.cells - c.answered),
            );
        }
    }

    info!(
        "Validated {} cells for {} subject/sessions",
        res.cells.len(),
        res.completeness.len()
    );
    Ok(res)
}
