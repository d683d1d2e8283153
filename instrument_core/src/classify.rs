//! Matching of raw column names to `(item, session, run)`.

use std::collections::{BTreeSet, HashMap};

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{ColumnHeader, Issue, IssueCode, ItemRef, DEFAULT_SESSION};
use crate::library::{LookupHit, MatchTier, TemplateLibrary};
use crate::sessions::session_label;

/// A trailing run indicator: `_run-2`, `-run2`, ` run_02`.
static RUN_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[_\-. ]run[-_]?(?P<run>\d+)$").expect("Invalid regex pattern for run suffixes")
});

/// A trailing session indicator: `_ses-2`, `_ses2`, `.ses-pre`, `_session-1`.
static SES_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[_\-. ](?:session|ses)(?:-(?P<label>[a-z0-9]+)|_?(?P<num>\d[a-z0-9]*))$")
        .expect("Invalid regex pattern for session suffixes")
});

/// The session and run parsed from the end of a column name.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ColumnSuffix {
    pub base: String,
    pub session: Option<String>,
    pub run: Option<u32>,
}

/// Strips the session and run indicators from the end of a name. Returns
/// `None` if the name carries neither.
pub fn parse_suffix(name: &str) -> Option<ColumnSuffix> {
    let mut base = name.trim().to_string();
    let mut session: Option<String> = None;
    let mut run: Option<u32> = None;
    // Both orders are accepted: `_ses-1_run-2` and `_run-2_ses-1`.
    for _ in 0..2 {
        if run.is_none() {
            // An index that does not fit is left in the name.
            if let Some(c) = RUN_SUFFIX.captures(&base) {
                if let Some(r) = c.name("run").and_then(|m| m.as_str().parse::<u32>().ok()) {
                    run = Some(r);
                    let start = c.get(0).map(|m| m.start()).unwrap_or(base.len());
                    base.truncate(start);
                }
            }
        }
        if session.is_none() {
            if let Some(c) = SES_SUFFIX.captures(&base) {
                let label = c.name("label").or_else(|| c.name("num")).map(|m| m.as_str());
                session = label.and_then(session_label);
                let start = c.get(0).map(|m| m.start()).unwrap_or(base.len());
                base.truncate(start);
            }
        }
    }
    if (session.is_none() && run.is_none()) || base.trim().is_empty() {
        None
    } else {
        Some(ColumnSuffix {
            base,
            session,
            run,
        })
    }
}

/// The run index of a name ending with a run indicator too large to be used.
pub fn oversized_run(name: &str) -> Option<String> {
    RUN_SUFFIX
        .captures(name.trim())
        .and_then(|c| c.name("run"))
        .map(|m| m.as_str())
        .filter(|r| r.parse::<u32>().is_err())
        .map(|r| r.to_string())
}

/// The resolved association of one raw column with a canonical item.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ColumnMapping {
    pub column_index: usize,
    pub raw_column: String,
    /// The decoded name that matched, for archive columns.
    pub decoded_name: Option<String>,
    pub item: ItemRef,
    pub session: String,
    /// The session comes from the column name rather than from a default.
    pub session_explicit: bool,
    /// `None` for the first run, which is implicit.
    pub run: Option<u32>,
    pub tier: MatchTier,
}

impl ColumnMapping {
    fn key(&self) -> (ItemRef, String, Option<u32>) {
        (self.item.clone(), self.session.clone(), self.run)
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct ColumnClassification {
    /// In column order.
    pub mappings: Vec<ColumnMapping>,
    /// Columns that match no item, in column order.
    pub unmatched: Vec<String>,
    /// The identifier and session columns.
    pub reserved: Vec<String>,
}

impl ColumnClassification {
    pub fn has_suffixed_columns(&self) -> bool {
        self.mappings.iter().any(|m| m.session_explicit)
    }

    /// The templates with at least one matched column, sorted.
    pub fn tasks(&self) -> Vec<String> {
        self.mappings
            .iter()
            .map(|m| m.item.template.clone())
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect()
    }
}

// A match before session/run assignment.
struct Found<'a> {
    name: &'a str,
    decoded: bool,
    hit: LookupHit,
    suffix: Option<ColumnSuffix>,
}

fn find<'a>(library: &TemplateLibrary, names: &[(&'a str, bool)]) -> Option<Found<'a>> {
    for &(name, decoded) in names.iter() {
        if let Some(hit) = library.lookup(name) {
            return Some(Found {
                name,
                decoded,
                hit,
                suffix: None,
            });
        }
    }
    for &(name, decoded) in names.iter() {
        if let Some(suffix) = parse_suffix(name) {
            if let Some(hit) = library.lookup(&suffix.base) {
                return Some(Found {
                    name,
                    decoded,
                    hit,
                    suffix: Some(suffix),
                });
            }
        }
    }
    None
}

/// Classifies every column of the input.
///
/// `reserved` are the indexes of the identifier and session columns. When
/// `row_sessions` is set, sessions of unsuffixed columns come from the rows
/// and no default-session notice is issued.
///
/// Every column ends up in exactly one of the mappings, the unmatched list or
/// the reserved list. Ambiguous and colliding columns are fatal; all of them
/// are reported together.
pub fn classify_columns(
    headers: &[ColumnHeader],
    reserved: &[usize],
    row_sessions: bool,
    library: &TemplateLibrary,
    issues: &mut Vec<Issue>,
) -> Result<ColumnClassification, Vec<Issue>> {
    let mut res = ColumnClassification::default();
    let mut fatal: Vec<Issue> = Vec::new();

    for (idx, header) in headers.iter().enumerate() {
        if reserved.contains(&idx) {
            res.reserved.push(header.raw.clone());
            continue;
        }
        let mut names: Vec<(&str, bool)> = header.decoded.iter().map(|s| (s.as_str(), true)).collect();
        names.push((header.raw.as_str(), false));

        let found = match find(library, &names) {
            Some(f) => f,
            None => {
                debug!("classify_columns: {:?}: no match", header.raw);
                let message = match names.iter().find_map(|(n, _)| oversized_run(n)) {
                    Some(r) => format!(
                        "column {} does not match any item, its run index {} is too large",
                        header.raw, r
                    ),
                    None => format!("column {} does not match any item", header.raw),
                };
                issues.push(Issue::warning(IssueCode::UnmatchedColumn, message).column(&header.raw));
                res.unmatched.push(header.raw.clone());
                continue;
            }
        };

        if found.hit.candidates.len() > 1 {
            let cands: Vec<String> = found.hit.candidates.iter().map(|c| c.to_string()).collect();
            fatal.push(
                Issue::error(
                    IssueCode::AmbiguousColumn,
                    format!(
                        "column {} matches several items: {}",
                        header.raw,
                        cands.join(", ")
                    ),
                )
                .column(&header.raw)
                .candidates(cands),
            );
            continue;
        }
        let item_ref = match found.hit.candidates.first() {
            Some(r) => r.clone(),
            None => continue,
        };
        let item = library.item(&item_ref);

        let explicit_session = found.suffix.as_ref().and_then(|s| s.session.clone());
        let session_explicit = explicit_session.is_some();
        let hinted_session = item.and_then(|i| i.session_hint.clone());
        let session = explicit_session
            .or_else(|| hinted_session.clone())
            .unwrap_or_else(|| DEFAULT_SESSION.to_string());
        let run = found
            .suffix
            .as_ref()
            .and_then(|s| s.run)
            .or_else(|| item.and_then(|i| i.run_hint))
            .filter(|r| *r != 1);

        if found.hit.tier == MatchTier::Normalized {
            issues.push(
                Issue::info(
                    IssueCode::NormalizedMatch,
                    format!(
                        "column {} matched {} by normalized comparison",
                        header.raw, item_ref
                    ),
                )
                .column(&header.raw)
                .item(&item_ref),
            );
        }
        if found.hit.via_alias {
            issues.push(
                Issue::info(
                    IssueCode::AliasResolved,
                    format!(
                        "column {} resolved through an alias to {}",
                        header.raw, item_ref
                    ),
                )
                .column(&header.raw)
                .item(&item_ref),
            );
        }
        if !session_explicit && hinted_session.is_none() && !row_sessions {
            issues.push(
                Issue::info(
                    IssueCode::DefaultSession,
                    format!("column {} assigned to default session {}", header.raw, session),
                )
                .column(&header.raw)
                .item(&item_ref)
                .session(&session),
            );
        }

        let mapping = ColumnMapping {
            column_index: idx,
            raw_column: header.raw.clone(),
            decoded_name: if found.decoded {
                Some(found.name.to_string())
            } else {
                None
            },
            item: item_ref,
            session,
            session_explicit,
            run,
            tier: found.hit.tier,
        };
        debug!("classify_columns: {:?}", mapping);
        res.mappings.push(mapping);
    }

    // The same (item, session, run) may only be fed by one column.
    let mut owners: HashMap<(ItemRef, String, Option<u32>), Vec<&ColumnMapping>> = HashMap::new();
    for m in res.mappings.iter() {
        owners.entry(m.key()).or_default().push(m);
    }
    let mut collisions: Vec<(&(ItemRef, String, Option<u32>), &Vec<&ColumnMapping>)> =
        owners.iter().filter(|(_, v)| v.len() > 1).collect();
    collisions.sort_by_key(|(_, v)| v[0].column_index);
    for ((item, session, run), cols) in collisions {
        let names: Vec<String> = cols.iter().map(|m| m.raw_column.clone()).collect();
        let mut issue = Issue::error(
            IssueCode::DuplicateMapping,
            format!(
                "columns {} all map to {} in {}{}",
                names.join(", "),
                item,
                session,
                run.map(|r| format!(" run-{}", r)).unwrap_or_default()
            ),
        )
        .item(item)
        .session(session)
        .candidates(names);
        if let Some(first) = cols.first() {
            issue = issue.column(&first.raw_column);
        }
        fatal.push(issue);
    }

    if !fatal.is_empty() {
        return Err(fatal);
    }
    if res.mappings.is_empty() {
        issues.push(Issue::warning(
            IssueCode::NoItemsMatched,
            "no column matches an item of the selected templates",
        ));
    }
    info!(
        "Columns: {} mapped, {} unmatched, {} reserved",
        res.mappings.len(),
        res.unmatched.len(),
        res.reserved.len()
    );
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TemplateBuilder;
    use crate::template::Item;

    fn headers(names: &[&str]) -> Vec<ColumnHeader> {
        names.iter().map(|n| ColumnHeader::plain(n)).collect()
    }

    fn library() -> TemplateLibrary {
        let mut q2 = Item::new("WB02", "calm");
        q2.aliases = vec!["calm_score".to_string()];
        let mut q3 = Item::new("WB03", "active");
        q3.session_hint = Some("ses-3".to_string());
        let t = TemplateBuilder::new("wellbeing")
            .item(Item::new("WB01", "cheerful"))
            .item(q2)
            .item(q3)
            .item(Item::new("WB04", "rested"))
            .alias_item("WB4_old", "WB04")
            .build();
        TemplateLibrary::build(vec![t], None).unwrap().0
    }

    #[test]
    fn suffixes() {
        let s = parse_suffix("WB01_ses-2").unwrap();
        assert_eq!(s.base, "WB01");
        assert_eq!(s.session.as_deref(), Some("ses-2"));
        assert_eq!(s.run, None);
        let s = parse_suffix("WB01_ses2_run-3").unwrap();
        assert_eq!((s.base.as_str(), s.session.as_deref(), s.run), ("WB01", Some("ses-2"), Some(3)));
        let s = parse_suffix("WB01-run2-ses-pre").unwrap();
        assert_eq!((s.base.as_str(), s.session.as_deref(), s.run), ("WB01", Some("ses-pre"), Some(2)));
        assert_eq!(parse_suffix("WB01"), None);
        assert_eq!(parse_suffix("WB01_session"), None);
        assert_eq!(parse_suffix("_ses-1"), None);
    }

    #[test]
    fn classification_conserves_columns() {
        let lib = library();
        let mut issues = Vec::new();
        let cols = headers(&["ID", "WB01", "calm_score", " wb03 ", "WB4_old_ses-2", "age", "WB01_ses-2"]);
        let c = classify_columns(&cols, &[0], false, &lib, &mut issues).unwrap();
        assert_eq!(c.reserved, vec!["ID".to_string()]);
        assert_eq!(c.unmatched, vec!["age".to_string()]);
        assert_eq!(c.mappings.len(), 5);
        assert_eq!(c.mappings.len() + c.unmatched.len() + c.reserved.len(), cols.len());

        let m: Vec<(&str, &str, &str)> = c
            .mappings
            .iter()
            .map(|m| (m.raw_column.as_str(), m.item.item_id.as_str(), m.session.as_str()))
            .collect();
        assert_eq!(
            m,
            vec![
                ("WB01", "WB01", "ses-1"),
                ("calm_score", "WB02", "ses-1"),
                (" wb03 ", "WB03", "ses-3"),
                ("WB4_old_ses-2", "WB04", "ses-2"),
                ("WB01_ses-2", "WB01", "ses-2"),
            ]
        );
        assert!(c.has_suffixed_columns());
        assert_eq!(c.tasks(), vec!["wellbeing".to_string()]);

        let codes: Vec<IssueCode> = issues.iter().map(|i| i.code).collect();
        assert!(codes.contains(&IssueCode::NormalizedMatch));
        assert!(codes.contains(&IssueCode::AliasResolved));
        assert!(codes.contains(&IssueCode::UnmatchedColumn));
        assert_eq!(
            issues.iter().filter(|i| i.code == IssueCode::DefaultSession).count(),
            2
        );
    }

    #[test]
    fn same_item_twice_without_suffix_is_fatal() {
        let lib = library();
        let mut issues = Vec::new();
        let fatal = classify_columns(&headers(&["WB02", "calm_score"]), &[], false, &lib, &mut issues)
            .unwrap_err();
        assert_eq!(fatal.len(), 1);
        assert_eq!(fatal[0].code, IssueCode::DuplicateMapping);
        assert_eq!(
            fatal[0].context.candidates,
            vec!["WB02".to_string(), "calm_score".to_string()]
        );
    }

    #[test]
    fn first_run_is_implicit() {
        let lib = library();
        let mut issues = Vec::new();
        let fatal = classify_columns(
            &headers(&["ID", "WB01", "WB01_run-1"]),
            &[0],
            false,
            &lib,
            &mut issues,
        )
        .unwrap_err();
        assert_eq!(fatal.len(), 1);
        assert_eq!(fatal[0].code, IssueCode::DuplicateMapping);
        assert_eq!(
            fatal[0].context.candidates,
            vec!["WB01".to_string(), "WB01_run-1".to_string()]
        );

        let c = classify_columns(&headers(&["WB01_run-1", "WB01_run-2"]), &[], false, &lib, &mut issues)
            .unwrap();
        let runs: Vec<Option<u32>> = c.mappings.iter().map(|m| m.run).collect();
        assert_eq!(runs, vec![None, Some(2)]);
    }

    #[test]
    fn oversized_runs_are_not_stripped() {
        assert_eq!(parse_suffix("WB01_run-99999999999"), None);
        assert_eq!(oversized_run("WB01_run-99999999999").as_deref(), Some("99999999999"));
        assert_eq!(oversized_run("WB01_run-2"), None);

        let lib = library();
        let mut issues = Vec::new();
        let c = classify_columns(&headers(&["WB01_run-99999999999"]), &[], false, &lib, &mut issues)
            .unwrap();
        assert_eq!(c.unmatched, vec!["WB01_run-99999999999".to_string()]);
        let unmatched = issues
            .iter()
            .find(|i| i.code == IssueCode::UnmatchedColumn)
            .unwrap();
        assert!(unmatched.message.contains("99999999999"));
    }

    #[test]
    fn ambiguous_columns_name_all_candidates() {
        let a = TemplateBuilder::new("a").item(Item::new("Q1", "q")).build();
        let b = TemplateBuilder::new("b").item(Item::new("q1", "q")).build();
        let lib = TemplateLibrary::build(vec![a, b], None).unwrap().0;
        let mut issues = Vec::new();
        let fatal = classify_columns(&headers(&["Q 1", "q1 "]), &[], false, &lib, &mut issues);
        // "Q 1" matches nothing; "q1 " matches both templates after normalization.
        let fatal = fatal.unwrap_err();
        assert_eq!(fatal.len(), 1);
        assert_eq!(fatal[0].code, IssueCode::AmbiguousColumn);
        assert_eq!(fatal[0].context.candidates, vec!["a:Q1".to_string(), "b:q1".to_string()]);
    }

    #[test]
    fn decoded_names_come_first() {
        let lib = library();
        let mut issues = Vec::new();
        let cols = vec![ColumnHeader {
            raw: "123X1X7".to_string(),
            decoded: vec!["nothing".to_string(), "WB01".to_string()],
        }];
        let c = classify_columns(&cols, &[], false, &lib, &mut issues).unwrap();
        assert_eq!(c.mappings[0].decoded_name.as_deref(), Some("WB01"));
        assert_eq!(c.mappings[0].raw_column, "123X1X7");
    }
}
