//! Subject identifiers, session labels and the duplicate-identifier policies.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info};

use crate::config::{DuplicatePolicy, InputTable, Issue, IssueCode, RunParameters, DEFAULT_SESSION};

/// Keeps the letters and digits of a label, in any script, lower-cased.
pub fn sanitize_label(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// `sub-<label>` for a raw identifier, or `None` if nothing usable is left.
pub fn subject_label(raw: &str) -> Option<String> {
    let t = raw.trim();
    let t = strip_prefix_ci(t, "sub-").unwrap_or(t);
    let label = sanitize_label(t);
    if label.is_empty() {
        None
    } else {
        Some(format!("sub-{}", label))
    }
}

/// `ses-<label>` for a raw session value: `2`, `ses-2`, `ses2` and `SES_2` all
/// give `ses-2`.
pub fn session_label(raw: &str) -> Option<String> {
    let t = raw.trim();
    let t = strip_prefix_ci(t, "ses-")
        .or_else(|| strip_prefix_ci(t, "ses_"))
        .or_else(|| {
            strip_prefix_ci(t, "ses")
                .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        })
        .unwrap_or(t);
    let label = sanitize_label(t);
    if label.is_empty() {
        None
    } else {
        Some(format!("ses-{}", label))
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum SessionStructure {
    Single,
    Multi,
}

/// One input row that takes part in the output.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ResolvedRow {
    /// 0-based index in the data rows.
    pub row_index: usize,
    pub raw_id: String,
    pub subject: String,
    /// The session imposed by the row (session column or duplicate
    /// splitting). `None` lets each column decide.
    pub session: Option<String>,
}

/// A subject of the output, with the sessions found for it.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct SubjectRecord {
    pub raw_id: String,
    pub subject: String,
    pub sessions: BTreeSet<String>,
    /// 0-based index of the first retained row of the subject.
    pub first_row: usize,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct SessionResolution {
    pub structure: SessionStructure,
    /// Retained rows, in input order.
    pub rows: Vec<ResolvedRow>,
    /// Rows that carried an identifier, duplicates included.
    pub participants: usize,
}

impl SessionResolution {
    pub fn unique_subjects(&self) -> usize {
        self.rows
            .iter()
            .map(|r| r.subject.as_str())
            .collect::<BTreeSet<&str>>()
            .len()
    }
}

/// Normalizes the identifiers of all the rows and applies the duplicate policy.
///
/// `has_suffixed_columns` tells whether the classifier found session-suffixed
/// columns. Fatal issues are only produced by the `error` policy.
pub fn resolve_sessions(
    table: &InputTable,
    subject_idx: usize,
    session_idx: Option<usize>,
    has_suffixed_columns: bool,
    params: &RunParameters,
    issues: &mut Vec<Issue>,
) -> Result<SessionResolution, Vec<Issue>> {
    let mut candidates: Vec<ResolvedRow> = Vec::new();
    for (row_index, row) in table.rows.iter().enumerate() {
        let lineno = row_index + 1;
        let raw_id = row.get(subject_idx).map(|s| s.trim()).unwrap_or("");
        let local_id = match params.id_map.get(raw_id) {
            Some(mapped) => {
                issues.push(
                    Issue::info(
                        IssueCode::IdRemapped,
                        format!("identifier {} remapped to {}", raw_id, mapped),
                    )
                    .row(lineno)
                    .values(vec![raw_id.to_string(), mapped.clone()]),
                );
                mapped.as_str()
            }
            None => raw_id,
        };
        let subject = match subject_label(local_id) {
            Some(s) => s,
            None => {
                issues.push(
                    Issue::warning(
                        IssueCode::EmptySubjectId,
                        format!("row {} has no usable subject identifier, skipped", lineno),
                    )
                    .row(lineno)
                    .column(&params.subject_column),
                );
                continue;
            }
        };
        let session = match session_idx {
            Some(idx) => {
                let v = row.get(idx).map(|s| s.as_str()).unwrap_or("");
                match session_label(v) {
                    Some(s) => Some(s),
                    None => {
                        issues.push(
                            Issue::warning(
                                IssueCode::EmptySession,
                                format!(
                                    "row {} has no session value, using {}",
                                    lineno, DEFAULT_SESSION
                                ),
                            )
                            .row(lineno)
                            .subject(&subject),
                        );
                        Some(DEFAULT_SESSION.to_string())
                    }
                }
            }
            None => None,
        };
        candidates.push(ResolvedRow {
            row_index,
            raw_id: raw_id.to_string(),
            subject,
            session,
        });
    }
    let participants = candidates.len();

    // Rows sharing a subject (and a session, when the input has a session column).
    let mut groups: BTreeMap<(String, Option<String>), Vec<usize>> = BTreeMap::new();
    for (pos, r) in candidates.iter().enumerate() {
        groups
            .entry((r.subject.clone(), r.session.clone()))
            .or_default()
            .push(pos);
    }
    let duplicated: Vec<(&(String, Option<String>), &Vec<usize>)> =
        groups.iter().filter(|(_, v)| v.len() > 1).collect();
    debug!(
        "resolve_sessions: {} rows, {} duplicated identifiers, policy {:?}",
        participants,
        duplicated.len(),
        params.duplicate_policy
    );

    let mut split_happened = false;
    let rows: Vec<ResolvedRow> = match params.duplicate_policy {
        DuplicatePolicy::Error => {
            if !duplicated.is_empty() {
                let fatal: Vec<Issue> = duplicated
                    .iter()
                    .map(|((subject, session), positions)| {
                        let raw_ids: Vec<String> = positions
                            .iter()
                            .map(|p| candidates[*p].raw_id.clone())
                            .collect();
                        let lines: Vec<String> = positions
                            .iter()
                            .map(|p| (candidates[*p].row_index + 1).to_string())
                            .collect();
                        let mut issue = Issue::error(
                            IssueCode::DuplicateSubject,
                            format!(
                                "subject identifier {} appears {} times (raw identifiers {}; rows {})",
                                subject,
                                positions.len(),
                                raw_ids.join(", "),
                                lines.join(", ")
                            ),
                        )
                        .subject(subject)
                        .count(positions.len())
                        .values(raw_ids);
                        if let Some(s) = session {
                            issue = issue.session(s);
                        }
                        issue
                    })
                    .collect();
                return Err(fatal);
            }
            candidates
        }
        DuplicatePolicy::KeepFirst | DuplicatePolicy::KeepLast => {
            let keep_last = params.duplicate_policy == DuplicatePolicy::KeepLast;
            let mut dropped: BTreeSet<usize> = BTreeSet::new();
            for (_, positions) in duplicated.iter() {
                let kept = if keep_last {
                    positions[positions.len() - 1]
                } else {
                    positions[0]
                };
                for p in positions.iter().filter(|p| **p != kept) {
                    let r = &candidates[*p];
                    issues.push(
                        Issue::info(
                            IssueCode::DuplicateDropped,
                            format!(
                                "row {} dropped: subject {} is kept from row {}",
                                r.row_index + 1,
                                r.subject,
                                candidates[kept].row_index + 1
                            ),
                        )
                        .row(r.row_index + 1)
                        .subject(&r.subject),
                    );
                    dropped.insert(*p);
                }
            }
            candidates
                .into_iter()
                .enumerate()
                .filter(|(p, _)| !dropped.contains(p))
                .map(|(_, r)| r)
                .collect()
        }
        DuplicatePolicy::SplitToSessions => {
            let mut used: HashMap<String, BTreeSet<String>> = HashMap::new();
            for r in candidates.iter() {
                used.entry(r.subject.clone())
                    .or_default()
                    .insert(r.session.clone().unwrap_or_else(|| DEFAULT_SESSION.to_string()));
            }
            let mut seen: HashMap<(String, Option<String>), usize> = HashMap::new();
            let mut res: Vec<ResolvedRow> = Vec::new();
            for mut r in candidates.into_iter() {
                let n = seen
                    .entry((r.subject.clone(), r.session.clone()))
                    .or_insert(0);
                *n += 1;
                if *n > 1 {
                    let taken = used.entry(r.subject.clone()).or_default();
                    let mut k = 2;
                    while taken.contains(&format!("ses-{}", k)) {
                        k += 1;
                    }
                    let new_session = format!("ses-{}", k);
                    taken.insert(new_session.clone());
                    issues.push(
                        Issue::info(
                            IssueCode::SessionSplit,
                            format!(
                                "row {}: repeated subject {} assigned to {}",
                                r.row_index + 1,
                                r.subject,
                                new_session
                            ),
                        )
                        .row(r.row_index + 1)
                        .subject(&r.subject)
                        .session(&new_session),
                    );
                    r.session = Some(new_session);
                    split_happened = true;
                }
                res.push(r);
            }
            res
        }
    };

    let structure = if session_idx.is_some() || has_suffixed_columns || split_happened {
        SessionStructure::Multi
    } else {
        SessionStructure::Single
    };
    info!(
        "Sessions: {:?} structure, {} rows retained out of {}",
        structure,
        rows.len(),
        participants
    );
    Ok(SessionResolution {
        structure,
        rows,
        participants,
    })
}
