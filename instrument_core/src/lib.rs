//! Conversion of wide survey exports into per-subject, per-session data files,
//! governed by a library of instrument templates.
//!
//! This crate is the pure part of the pipeline: it never reads or writes
//! files. The entry point is [`plan_conversion`], which runs every stage up
//! to the preview and returns either a [`ConversionPlan`] or the issues that
//! aborted the run. See the [`manual`] for the template format and the
//! matching rules.

mod archive;
mod classify;
mod config;
mod library;
mod sessions;
mod template;
mod validate;

pub mod builder;
pub mod manual;

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};

pub use crate::archive::{
    decode_headers, ArchiveMetadata, DecodeError, DecodedField, DecodedStructure, FieldHints,
    StructureDecoder,
};
pub use crate::classify::{
    classify_columns, parse_suffix, ColumnClassification, ColumnMapping, ColumnSuffix,
};
pub use crate::config::*;
pub use crate::library::{normalize_name, LookupHit, MatchTier, TemplateLibrary, MAX_ALIAS_HOPS};
pub use crate::sessions::{
    resolve_sessions, sanitize_label, session_label, subject_label, ResolvedRow,
    SessionResolution, SessionStructure, SubjectRecord,
};
pub use crate::template::{Item, StudyMetadata, Template, TemplateError, DEFAULT_LANGUAGE};
pub use crate::validate::{
    check_value, normalize_level, validate_rows, CellStatus, CheckedValue, Completeness,
    ResponseCell, ValidationResult, MISSING_VALUE,
};

/// The content of one data file: the values of one subject, session, task and
/// run.
#[derive(PartialEq, Debug, Clone)]
pub struct OutputRecord {
    pub subject: String,
    pub session: String,
    /// The template key.
    pub task: String,
    pub run: Option<u32>,
    pub raw_id: String,
    /// Item ids in template order.
    pub items: Vec<String>,
    /// Aligned with `items`.
    pub values: Vec<String>,
}

impl OutputRecord {
    /// `sub-<s>_ses-<t>_task-<task>[_run-<n>]_survey`
    pub fn stem(&self) -> String {
        let mut s = format!(
            "{}_{}_task-{}",
            self.subject,
            self.session,
            sanitize_label(&self.task)
        );
        if let Some(r) = self.run {
            s.push_str(&format!("_run-{}", r));
        }
        s.push_str("_survey");
        s
    }

    /// Relative to the output root.
    pub fn directory(&self) -> String {
        format!("{}/{}/survey", self.subject, self.session)
    }

    pub fn data_path(&self) -> String {
        format!("{}/{}.tsv", self.directory(), self.stem())
    }

    pub fn sidecar_path(&self) -> String {
        format!("{}/{}.json", self.directory(), self.stem())
    }
}

/// The sidecar shared by all the data files of a task, at the dataset root.
pub fn dataset_sidecar_path(task: &str) -> String {
    format!("task-{}_survey.json", sanitize_label(task))
}

/// Everything decided by a run that reached the preview.
///
/// A preview stops here. A commit writes `planned_files` from `records` and
/// fills `report.files_written`.
#[derive(Debug, Clone)]
pub struct ConversionPlan {
    pub report: ConversionReport,
    pub library: TemplateLibrary,
    pub structure: SessionStructure,
    /// Sorted by subject label.
    pub subjects: Vec<SubjectRecord>,
    /// Sorted by subject, session, task and run.
    pub records: Vec<OutputRecord>,
    pub cells: Vec<ResponseCell>,
    /// Relative paths, in writing order.
    pub planned_files: Vec<String>,
}

// The mutable state of one run: the accumulated issues.
struct RunState<'a> {
    table: &'a InputTable,
    cancel: &'a CancelToken,
    issues: Vec<Issue>,
}

impl<'a> RunState<'a> {
    fn enter(&mut self, stage: ConversionStage) -> Result<(), ConversionAborted> {
        if self.cancel.is_cancelled() {
            let issue = Issue::error(
                IssueCode::Cancelled,
                format!("the run was cancelled before {}", stage),
            );
            return Err(self.abort(stage, vec![issue]));
        }
        info!("Stage: {}", stage);
        Ok(())
    }

    fn abort(&mut self, stage: ConversionStage, fatal: Vec<Issue>) -> ConversionAborted {
        for i in fatal.iter() {
            warn!("Aborted while {}: {:?}: {}", stage, i.code, i.message);
        }
        let mut issues = std::mem::take(&mut self.issues);
        issues.extend(fatal.iter().cloned());
        ConversionAborted {
            stage,
            fatal,
            report: ConversionReport {
                source: self.table.source.clone(),
                input_digest: self.table.digest.clone(),
                issues,
                ..ConversionReport::default()
            },
        }
    }
}

/// Finds a reserved column by name: exact, then ignoring case and
/// surrounding spaces, then among the decoded names.
fn find_column(headers: &[ColumnHeader], name: &str) -> Option<usize> {
    let name = name.trim();
    headers
        .iter()
        .position(|h| h.raw == name)
        .or_else(|| {
            headers
                .iter()
                .position(|h| h.raw.trim().eq_ignore_ascii_case(name))
        })
        .or_else(|| {
            headers
                .iter()
                .position(|h| h.decoded.iter().any(|d| d.eq_ignore_ascii_case(name)))
        })
}

fn missing_column(code: IssueCode, what: &str, name: &str, headers: &[ColumnHeader]) -> Issue {
    Issue::error(
        code,
        format!("the {} column {:?} is not in the input", what, name),
    )
    .column(name)
    .candidates(headers.iter().map(|h| h.raw.clone()).collect())
}

/// Runs a conversion up to the preview.
///
/// Arguments:
/// * `table` the input, after reading and optional archive decoding
/// * `templates` the templates found in the library roots, in priority order
/// * `template_issues` what went wrong while reading the template files; these
/// issues open the report
/// * `params` the parameters of the run
/// * `cancel` checked before every stage
///
/// The outcome only depends on the arguments: a preview and a commit of the
/// same input produce the same report, up to the files written.
pub fn plan_conversion(
    table: &InputTable,
    templates: Vec<Template>,
    template_issues: Vec<Issue>,
    params: &RunParameters,
    cancel: &CancelToken,
) -> Result<ConversionPlan, ConversionAborted> {
    info!(
        "Converting {}: {} columns, {} rows, {} templates, policy {:?}",
        table.source,
        table.headers.len(),
        table.rows.len(),
        templates.len(),
        params.duplicate_policy
    );
    let mut run = RunState {
        table,
        cancel,
        issues: template_issues,
    };

    run.enter(ConversionStage::LoadingTemplates)?;
    let library = match TemplateLibrary::build(templates, params.instruments.as_deref()) {
        Ok((lib, issues)) => {
            run.issues.extend(issues);
            lib
        }
        Err(fatal) => return Err(run.abort(ConversionStage::LoadingTemplates, fatal)),
    };

    run.enter(ConversionStage::ClassifyingColumns)?;
    let subject_idx = match find_column(&table.headers, &params.subject_column) {
        Some(idx) => idx,
        None => {
            let issue = missing_column(
                IssueCode::MissingSubjectColumn,
                "subject",
                &params.subject_column,
                &table.headers,
            );
            return Err(run.abort(ConversionStage::ClassifyingColumns, vec![issue]));
        }
    };
    let session_idx = match params.session_column.as_ref() {
        Some(name) => match find_column(&table.headers, name) {
            Some(idx) => Some(idx),
            None => {
                let issue = missing_column(
                    IssueCode::MissingSessionColumn,
                    "session",
                    name,
                    &table.headers,
                );
                return Err(run.abort(ConversionStage::ClassifyingColumns, vec![issue]));
            }
        },
        None => None,
    };
    let mut reserved = vec![subject_idx];
    reserved.extend(session_idx);
    let classification = match classify_columns(
        &table.headers,
        &reserved,
        session_idx.is_some(),
        &library,
        &mut run.issues,
    ) {
        Ok(c) => c,
        Err(fatal) => return Err(run.abort(ConversionStage::ClassifyingColumns, fatal)),
    };
    let shared = library.shared_item_ids(&classification.tasks());
    if !shared.is_empty() {
        return Err(run.abort(ConversionStage::ClassifyingColumns, shared));
    }

    run.enter(ConversionStage::ResolvingSessions)?;
    let resolution = match resolve_sessions(
        table,
        subject_idx,
        session_idx,
        classification.has_suffixed_columns(),
        params,
        &mut run.issues,
    ) {
        Ok(r) => r,
        Err(fatal) => return Err(run.abort(ConversionStage::ResolvingSessions, fatal)),
    };

    run.enter(ConversionStage::ValidatingRows)?;
    let validation = match validate_rows(
        table,
        &classification,
        &resolution,
        &library,
        params,
        table.strict_levels,
        &mut run.issues,
    ) {
        Ok(v) => v,
        Err(fatal) => return Err(run.abort(ConversionStage::ValidatingRows, fatal)),
    };

    run.enter(ConversionStage::Preview)?;
    let records = build_records(&validation.cells, &library);
    let subjects = build_subjects(&resolution, &records);

    let mut planned_files: Vec<String> = Vec::new();
    for r in records.iter() {
        planned_files.push(r.data_path());
        planned_files.push(r.sidecar_path());
    }
    let tasks = classification.tasks();
    if params.dataset_sidecar {
        for t in tasks.iter() {
            planned_files.push(dataset_sidecar_path(t));
        }
    }

    // Unsuffixed columns follow the rows when the rows carry sessions.
    let row_sessions = session_idx.is_some() || resolution.rows.iter().any(|r| r.session.is_some());
    let column_mapping: Vec<ColumnMappingEntry> = classification
        .mappings
        .iter()
        .zip(validation.missing_pct.iter())
        .map(|(m, pct)| ColumnMappingEntry {
            raw_column: m.raw_column.clone(),
            decoded_name: m.decoded_name.clone(),
            task: m.item.template.clone(),
            item_id: m.item.item_id.clone(),
            session: if m.session_explicit || !row_sessions {
                Some(m.session.clone())
            } else {
                None
            },
            run: m.run,
            missing_pct: *pct,
        })
        .collect();

    let mut raw_ids: BTreeMap<(&str, &str), &str> = BTreeMap::new();
    for c in validation.cells.iter() {
        raw_ids
            .entry((c.subject.as_str(), c.session.as_str()))
            .or_insert(c.raw_id.as_str());
    }
    let participant_preview: Vec<ParticipantPreview> = validation
        .completeness
        .iter()
        .map(|((subject, session), c)| ParticipantPreview {
            subject: subject.clone(),
            session: session.clone(),
            raw_id: raw_ids
                .get(&(subject.as_str(), session.as_str()))
                .map(|s| s.to_string())
                .unwrap_or_default(),
            completeness_pct: validate::percent(c.ratio()),
        })
        .collect();

    let sessions: BTreeSet<String> = records.iter().map(|r| r.session.clone()).collect();
    let report = ConversionReport {
        source: table.source.clone(),
        input_digest: table.digest.clone(),
        summary: ReportSummary {
            participants: resolution.participants,
            unique_participants: resolution.unique_subjects(),
            tasks,
            sessions: sessions.into_iter().collect(),
            files_to_create: planned_files.len(),
        },
        issues: std::mem::take(&mut run.issues),
        column_mapping,
        unmatched_columns: classification.unmatched.clone(),
        participant_preview,
        files_written: Vec::new(),
    };
    info!(
        "Preview: {} participants ({} unique), tasks {:?}, {} files to create, {} issues",
        report.summary.participants,
        report.summary.unique_participants,
        report.summary.tasks,
        report.summary.files_to_create,
        report.issues.len()
    );

    Ok(ConversionPlan {
        report,
        library,
        structure: resolution.structure,
        subjects,
        records,
        cells: validation.cells,
        planned_files,
    })
}

fn build_records(cells: &[ResponseCell], library: &TemplateLibrary) -> Vec<OutputRecord> {
    let mut groups: BTreeMap<(&str, &str, &str, Option<u32>), Vec<&ResponseCell>> =
        BTreeMap::new();
    for c in cells.iter() {
        groups
            .entry((
                c.subject.as_str(),
                c.session.as_str(),
                c.item.template.as_str(),
                c.run,
            ))
            .or_default()
            .push(c);
    }
    groups
        .into_iter()
        .map(|((subject, session, task, run), mut group)| {
            group.sort_by_key(|c| library.item_position(&c.item));
            debug!(
                "build_records: {} {} {} run {:?}: {} values",
                subject,
                session,
                task,
                run,
                group.len()
            );
            OutputRecord {
                subject: subject.to_string(),
                session: session.to_string(),
                task: task.to_string(),
                run,
                raw_id: group
                    .first()
                    .map(|c| c.raw_id.clone())
                    .unwrap_or_default(),
                items: group.iter().map(|c| c.item.item_id.clone()).collect(),
                values: group.iter().map(|c| c.value.clone()).collect(),
            }
        })
        .collect()
}

fn build_subjects(resolution: &SessionResolution, records: &[OutputRecord]) -> Vec<SubjectRecord> {
    let mut subjects: BTreeMap<&str, SubjectRecord> = BTreeMap::new();
    for row in resolution.rows.iter() {
        let rec = subjects
            .entry(row.subject.as_str())
            .or_insert_with(|| SubjectRecord {
                raw_id: row.raw_id.clone(),
                subject: row.subject.clone(),
                sessions: BTreeSet::new(),
                first_row: row.row_index,
            });
        if let Some(s) = row.session.as_ref() {
            rec.sessions.insert(s.clone());
        }
    }
    for r in records.iter() {
        if let Some(rec) = subjects.get_mut(r.subject.as_str()) {
            rec.sessions.insert(r.session.clone());
        }
    }
    for rec in subjects.values_mut() {
        if rec.sessions.is_empty() {
            rec.sessions.insert(DEFAULT_SESSION.to_string());
        }
    }
    subjects.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TemplateBuilder;
    use pretty_assertions::assert_eq;

    const LEVELS: [&str; 6] = ["0", "1", "2", "3", "4", "5"];

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn wellbeing() -> Template {
        let mut b = TemplateBuilder::new("wellbeing");
        for i in 1..=5 {
            let id = format!("WB0{}", i);
            b = b.levels_item(&id, &format!("item {}", i), &LEVELS);
        }
        b.build()
    }

    fn table(headers: &[&str], rows: &[&[&str]]) -> InputTable {
        let headers: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
        let rows: Vec<Vec<String>> = rows
            .iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect();
        InputTable::new("survey.csv", "digest", &headers, rows)
    }

    fn params(policy: DuplicatePolicy) -> RunParameters {
        let mut p = RunParameters::new("ID");
        p.duplicate_policy = policy;
        p
    }

    fn plan(
        t: &InputTable,
        templates: Vec<Template>,
        p: &RunParameters,
    ) -> Result<ConversionPlan, ConversionAborted> {
        plan_conversion(t, templates, vec![], p, &CancelToken::new())
    }

    #[test]
    fn end_to_end_keep_last() {
        init();
        let t = table(
            &["ID", "WB01", "WB02", "WB03", "WB04", "WB05"],
            &[
                &["S1", "0", "1", "2", "3", "4"],
                &["S2", "1", "1", "1", "1", "1"],
                &["S2", "5", "5", "5", "5", "5"],
            ],
        );
        let res = plan(&t, vec![wellbeing()], &params(DuplicatePolicy::KeepLast)).unwrap();
        let report = &res.report;
        assert_eq!(report.summary.participants, 3);
        assert_eq!(report.summary.unique_participants, 2);
        assert_eq!(report.summary.tasks, vec!["wellbeing".to_string()]);
        assert_eq!(report.summary.sessions, vec!["ses-1".to_string()]);
        assert!(report.unmatched_columns.is_empty());
        assert_eq!(report.column_mapping.len(), 5);
        assert_eq!(report.issues_with_code(IssueCode::DuplicateDropped).len(), 1);
        assert_eq!(report.errors().count(), 0);

        assert_eq!(res.records.len(), 2);
        let s2 = &res.records[1];
        assert_eq!(s2.subject, "sub-s2");
        assert_eq!(s2.values, vec!["5"; 5]);
        assert_eq!(
            s2.data_path(),
            "sub-s2/ses-1/survey/sub-s2_ses-1_task-wellbeing_survey.tsv"
        );
        assert_eq!(report.summary.files_to_create, 4);
        assert_eq!(res.subjects[1].first_row, 2);
        assert_eq!(res.structure, SessionStructure::Single);
    }

    #[test]
    fn duplicate_policies() {
        let t = table(&["ID", "WB01"], &[&["P1", "1"], &["p1", "2"], &["P2", "3"]]);

        let aborted = plan(&t, vec![wellbeing()], &params(DuplicatePolicy::Error)).unwrap_err();
        assert_eq!(aborted.stage, ConversionStage::ResolvingSessions);
        assert!(aborted.has_fatal(IssueCode::DuplicateSubject));
        assert_eq!(aborted.fatal.len(), 1);
        assert_eq!(aborted.fatal[0].context.subject.as_deref(), Some("sub-p1"));
        assert_eq!(
            aborted.fatal[0].context.values,
            vec!["P1".to_string(), "p1".to_string()]
        );
        // The column classification issues come before the fatal one.
        assert!(aborted.report.issues.len() > 1);

        let split = plan(&t, vec![wellbeing()], &params(DuplicatePolicy::SplitToSessions)).unwrap();
        let keys: Vec<(&str, &str, &str)> = split
            .records
            .iter()
            .map(|r| (r.subject.as_str(), r.session.as_str(), r.values[0].as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("sub-p1", "ses-1", "1"),
                ("sub-p1", "ses-2", "2"),
                ("sub-p2", "ses-1", "3")
            ]
        );
        assert_eq!(split.structure, SessionStructure::Multi);
        assert_eq!(split.report.column_mapping[0].session, None);

        let first = plan(&t, vec![wellbeing()], &params(DuplicatePolicy::KeepFirst)).unwrap();
        assert_eq!(first.records[0].values, vec!["1".to_string()]);
        let dropped = first.report.issues_with_code(IssueCode::DuplicateDropped);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].severity, Severity::Info);
        assert_eq!(dropped[0].context.row, Some(2));
    }

    #[test]
    fn alias_chains_and_cycles() {
        let chain = TemplateBuilder::new("chain")
            .item(Item::new("C", "canonical"))
            .alias_item("B", "C")
            .alias_item("A", "B")
            .build();
        let t = table(&["ID", "A"], &[&["x", "yes"]]);
        let res = plan(&t, vec![chain], &params(DuplicatePolicy::Error)).unwrap();
        assert_eq!(res.report.column_mapping[0].item_id, "C");
        assert_eq!(res.report.issues_with_code(IssueCode::AliasResolved).len(), 1);

        let cycle = TemplateBuilder::new("loop")
            .alias_item("A", "B")
            .alias_item("B", "A")
            .build();
        let aborted = plan(&t, vec![cycle], &params(DuplicatePolicy::Error)).unwrap_err();
        assert_eq!(aborted.stage, ConversionStage::LoadingTemplates);
        assert!(aborted.has_fatal(IssueCode::AliasCycle));
    }

    #[test]
    fn templates_used_together_cannot_share_items() {
        let a = TemplateBuilder::new("a")
            .item(Item::new("Q1", "q"))
            .item(Item::new("Q2", "q"))
            .build();
        let b = TemplateBuilder::new("b")
            .item(Item::new("Q2", "q"))
            .item(Item::new("Q3", "q"))
            .build();
        let t = table(&["ID", "Q1", "Q3"], &[&["x", "1", "2"]]);
        let aborted = plan(&t, vec![a.clone(), b.clone()], &params(DuplicatePolicy::Error))
            .unwrap_err();
        assert_eq!(aborted.stage, ConversionStage::ClassifyingColumns);
        assert!(aborted.has_fatal(IssueCode::DuplicateItemId));

        // Only one of them is used: the shared id does not matter.
        let t = table(&["ID", "Q1"], &[&["x", "1"]]);
        let res = plan(&t, vec![a.clone(), b.clone()], &params(DuplicatePolicy::Error)).unwrap();
        assert_eq!(res.report.summary.tasks, vec!["a".to_string()]);

        // An explicit single instrument hides the other one.
        let t = table(&["ID", "Q2"], &[&["x", "1"]]);
        let mut p = params(DuplicatePolicy::Error);
        p.instruments = Some(vec!["b".to_string()]);
        let res = plan(&t, vec![a, b], &p).unwrap();
        assert_eq!(res.report.column_mapping[0].task, "b");
    }

    #[test]
    fn every_column_is_accounted_for() {
        let t = table(
            &["ID", "visit", "WB01", "WB02_ses-2", "age", "WB03_run-2", "comments"],
            &[&["a", "1", "1", "2", "30", "3", ""]],
        );
        let mut p = params(DuplicatePolicy::Error);
        p.session_column = Some("Visit".to_string());
        let res = plan(&t, vec![wellbeing()], &p).unwrap();
        let report = &res.report;
        let mapped: BTreeSet<&str> = report
            .column_mapping
            .iter()
            .map(|m| m.raw_column.as_str())
            .collect();
        let unmatched: BTreeSet<&str> =
            report.unmatched_columns.iter().map(|s| s.as_str()).collect();
        assert!(mapped.is_disjoint(&unmatched));
        // Subject and session columns are the two remaining ones.
        assert_eq!(mapped.len() + unmatched.len() + 2, t.headers.len());
        assert_eq!(
            unmatched,
            ["age", "comments"].into_iter().collect::<BTreeSet<&str>>()
        );

        let m: Vec<(&str, Option<&str>, Option<u32>)> = report
            .column_mapping
            .iter()
            .map(|m| (m.item_id.as_str(), m.session.as_deref(), m.run))
            .collect();
        assert_eq!(
            m,
            vec![("WB01", None, None), ("WB02", Some("ses-2"), None), ("WB03", None, Some(2))]
        );
        let paths: Vec<String> = res.records.iter().map(|r| r.data_path()).collect();
        assert_eq!(
            paths,
            vec![
                "sub-a/ses-1/survey/sub-a_ses-1_task-wellbeing_survey.tsv".to_string(),
                "sub-a/ses-1/survey/sub-a_ses-1_task-wellbeing_run-2_survey.tsv".to_string(),
                "sub-a/ses-2/survey/sub-a_ses-2_task-wellbeing_survey.tsv".to_string(),
            ]
        );
    }

    #[test]
    fn missing_subject_column_and_cancellation() {
        let t = table(&["participant", "WB01"], &[&["a", "1"]]);
        let aborted = plan(&t, vec![wellbeing()], &params(DuplicatePolicy::Error)).unwrap_err();
        assert!(aborted.has_fatal(IssueCode::MissingSubjectColumn));
        assert_eq!(
            aborted.fatal[0].context.candidates,
            vec!["participant".to_string(), "WB01".to_string()]
        );

        let cancel = CancelToken::new();
        cancel.cancel();
        let t = table(&["ID", "WB01"], &[&["a", "1"]]);
        let aborted = plan_conversion(
            &t,
            vec![wellbeing()],
            vec![],
            &params(DuplicatePolicy::Error),
            &cancel,
        )
        .unwrap_err();
        assert_eq!(aborted.stage, ConversionStage::LoadingTemplates);
        assert!(aborted.has_fatal(IssueCode::Cancelled));
        assert!(aborted.report.column_mapping.is_empty());
    }

    #[test]
    fn planning_is_deterministic() {
        let t = table(
            &["ID", "WB01", "WB02", "extra"],
            &[&["b", "9", ""], &["a", "1", "2", "x"]],
        );
        let mut p = params(DuplicatePolicy::Error);
        p.dataset_sidecar = true;
        let r1 = plan(&t, vec![wellbeing()], &p).unwrap();
        let r2 = plan(&t, vec![wellbeing()], &p).unwrap();
        assert_eq!(r1.report, r2.report);
        assert_eq!(r1.planned_files, r2.planned_files);
        assert_eq!(r1.planned_files.last().map(|s| s.as_str()), Some("task-wellbeing_survey.json"));
        assert_eq!(r1.report.summary.files_to_create, 5);
        // Subjects are sorted by label, not by input order.
        assert_eq!(r1.report.participant_preview[0].subject, "sub-a");
        assert_eq!(r1.report.participant_preview[1].completeness_pct, 50.0);
    }
}
