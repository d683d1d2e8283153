// Writing the dataset of a committed run.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde_json::Value as JSValue;
use walkdir::WalkDir;

use crate::convert::*;

pub const PARTICIPANTS_FILE: &str = "participants.tsv";

// Conflicting paths quoted in the report.
const CONFLICT_SAMPLE: usize = 10;

/// The content of `participants.tsv`: one row per subject, in label order.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ParticipantsTable {
    /// The mapped columns, after `participant_id`.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn sanitize_cell(v: &str) -> String {
    v.replace(['\t', '\n', '\r'], " ")
}

fn tsv_line(cells: &[String]) -> String {
    let cells: Vec<String> = cells.iter().map(|c| sanitize_cell(c)).collect();
    format!("{}\n", cells.join("\t"))
}

impl ParticipantsTable {
    fn to_tsv(&self) -> String {
        let mut header = vec!["participant_id".to_string()];
        header.extend(self.columns.iter().cloned());
        let mut s = tsv_line(&header);
        for r in self.rows.iter() {
            s.push_str(&tsv_line(r));
        }
        s
    }
}

/// Reads the flat JSON object mapping unmatched input columns to
/// `participants.tsv` columns, in document order.
pub fn read_participants_mapping(path: &Path) -> ConvertResult<Vec<(String, String)>> {
    let path_s = path.display().to_string();
    let contents = fs::read_to_string(path).context(OpeningFileSnafu {
        path: path_s.clone(),
    })?;
    let js: JSValue =
        serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu { path: &path_s })?;
    let obj = match js.as_object() {
        Some(o) => o,
        None => whatever!("{}: the participants mapping must be a JSON object", path_s),
    };
    let mut res: Vec<(String, String)> = Vec::new();
    for (k, v) in obj.iter() {
        match v.as_str() {
            Some(target) => res.push((k.clone(), target.trim().to_string())),
            None => whatever!(
                "{}: the target of column {:?} must be a string, found {}",
                path_s,
                k,
                v
            ),
        }
    }
    Ok(res)
}

/// Builds `participants.tsv` from the unmatched columns and adds it to the
/// planned files.
///
/// Values come from the first retained row of each subject. Mapping entries
/// that do not name an unmatched column are reported and ignored.
pub fn participants_table(
    plan: &mut ConversionPlan,
    table: &InputTable,
    mapping: &[(String, String)],
    params: &RunParameters,
) -> ParticipantsTable {
    let mut columns: Vec<(usize, String)> = Vec::new();
    let mut targets: BTreeSet<&str> = BTreeSet::new();
    targets.insert("participant_id");
    for (raw, target) in mapping.iter() {
        let idx = table.headers.iter().position(|h| &h.raw == raw);
        let issue = match idx {
            None => Some(format!("the column {:?} is not in the input", raw)),
            Some(_) if !plan.report.unmatched_columns.contains(raw) => Some(format!(
                "the column {:?} is used by an instrument or as identifier, it cannot feed participants.tsv",
                raw
            )),
            Some(_) if target.is_empty() || targets.contains(target.as_str()) => Some(format!(
                "the participants column {:?} is empty or already used",
                target
            )),
            Some(i) => {
                targets.insert(target.as_str());
                columns.push((i, target.clone()));
                None
            }
        };
        if let Some(msg) = issue {
            warn!("participants_table: {}", msg);
            plan.report
                .issues
                .push(Issue::warning(IssueCode::ParticipantsMapping, msg).column(raw));
        }
    }

    let rows: Vec<Vec<String>> = plan
        .subjects
        .iter()
        .map(|s| {
            let mut row = vec![s.subject.clone()];
            for (idx, _) in columns.iter() {
                let v = table
                    .rows
                    .get(s.first_row)
                    .and_then(|r| r.get(*idx))
                    .map(|v| v.trim())
                    .unwrap_or("");
                row.push(if params.is_missing_token(v) {
                    MISSING_VALUE.to_string()
                } else {
                    v.to_string()
                });
            }
            row
        })
        .collect();
    info!(
        "participants_table: {} subjects, columns {:?}",
        rows.len(),
        columns.iter().map(|(_, t)| t.as_str()).collect::<Vec<_>>()
    );

    plan.planned_files.push(PARTICIPANTS_FILE.to_string());
    plan.report.summary.files_to_create = plan.planned_files.len();
    ParticipantsTable {
        columns: columns.into_iter().map(|(_, t)| t).collect(),
        rows,
    }
}

fn pretty_json(js: &JSValue, path: &str) -> ConvertResult<String> {
    let s = serde_json::to_string_pretty(js).context(ParsingJsonSnafu { path })?;
    Ok(format!("{}\n", s))
}

// The contents of all the planned files, in the same order.
fn render_files(
    plan: &ConversionPlan,
    participants: Option<&ParticipantsTable>,
) -> ConvertResult<Vec<(String, String)>> {
    let mut res: Vec<(String, String)> = Vec::new();
    for r in plan.records.iter() {
        let template = match plan.library.template(&r.task) {
            Some(t) => t,
            None => whatever!("No template {} for {}", r.task, r.data_path()),
        };
        let mut content = tsv_line(&r.items);
        content.push_str(&tsv_line(&r.values));
        res.push((r.data_path(), content));
        let sidecar_path = r.sidecar_path();
        let sidecar = pretty_json(&template.sidecar(&r.items), &sidecar_path)?;
        res.push((sidecar_path, sidecar));
    }

    for task in plan.report.summary.tasks.iter() {
        let path = dataset_sidecar_path(task);
        if !plan.planned_files.contains(&path) {
            continue;
        }
        if let Some(template) = plan.library.template(task) {
            let used: BTreeSet<&str> = plan
                .records
                .iter()
                .filter(|r| &r.task == task)
                .flat_map(|r| r.items.iter().map(|s| s.as_str()))
                .collect();
            let items: Vec<String> = template
                .items
                .iter()
                .filter(|i| used.contains(i.item_id.as_str()))
                .map(|i| i.item_id.clone())
                .collect();
            let sidecar = pretty_json(&template.sidecar(&items), &path)?;
            res.push((path, sidecar));
        }
    }

    if let Some(p) = participants {
        res.push((PARTICIPANTS_FILE.to_string(), p.to_tsv()));
    }
    Ok(res)
}

// The files left in `root` by earlier runs of the given tasks: data files,
// their sidecars and the dataset sidecars.
fn task_files(root: &Path, tasks: &[String]) -> ConvertResult<Vec<String>> {
    let mut res: Vec<String> = Vec::new();
    if !root.is_dir() {
        return Ok(res);
    }
    let directory = root.display().to_string();
    let markers: Vec<String> = tasks.iter().map(|t| format!("_task-{}_", t)).collect();
    for entry_r in WalkDir::new(root)
        .min_depth(4)
        .max_depth(4)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = entry_r.context(ScanningOutputSnafu {
            directory: directory.clone(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        let in_survey_dir = parts.len() == 4
            && parts[0].starts_with("sub-")
            && parts[1].starts_with("ses-")
            && parts[2] == "survey";
        if in_survey_dir && markers.iter().any(|m| parts[3].contains(m.as_str())) {
            res.push(parts.join("/"));
        }
    }
    for task in tasks.iter() {
        let p = dataset_sidecar_path(task);
        if root.join(&p).is_file() {
            res.push(p);
        }
    }
    debug!("task_files: {} files of {:?} in {}", res.len(), tasks, directory);
    Ok(res)
}

fn write_file(root: &Path, rel: &str, content: &str) -> std::io::Result<()> {
    let p = root.join(rel);
    if let Some(d) = p.parent() {
        fs::create_dir_all(d)?;
    }
    fs::write(&p, content)
}

/// Writes the planned files under `root`.
///
/// Without `overwrite`, nothing is written when one of the planned files
/// already exists, or when the directory holds files of a task of the run
/// from an earlier commit. A failed write stops the run; the report of the
/// error lists the files written before.
pub fn commit(
    root: &Path,
    overwrite: bool,
    plan: &ConversionPlan,
    participants: Option<&ParticipantsTable>,
) -> ConvertResult<ConversionReport> {
    let mut report = plan.report.clone();
    let directory = root.display().to_string();
    let files = render_files(plan, participants)?;

    if !overwrite {
        let mut conflicts: Vec<String> = plan
            .planned_files
            .iter()
            .filter(|p| root.join(p).exists())
            .cloned()
            .collect();
        for p in task_files(root, &plan.report.summary.tasks)? {
            if !conflicts.contains(&p) {
                conflicts.push(p);
            }
        }
        if !conflicts.is_empty() {
            warn!(
                "commit: {} planned files already exist in {}",
                conflicts.len(),
                directory
            );
            report.issues.push(
                Issue::error(
                    IssueCode::OutputConflict,
                    format!(
                        "{} files already exist in the output directory",
                        conflicts.len()
                    ),
                )
                .file(&directory)
                .count(conflicts.len())
                .values(conflicts.iter().take(CONFLICT_SAMPLE).cloned().collect()),
            );
            return OutputConflictSnafu {
                directory,
                conflicts,
                report: Box::new(report),
            }
            .fail();
        }
    }

    for (rel, content) in files.into_iter() {
        if let Err(e) = write_file(root, &rel, &content) {
            warn!("commit: failed to write {}: {}", rel, e);
            report.issues.push(
                Issue::error(IssueCode::WriteFailed, format!("cannot write {}: {}", rel, e))
                    .file(&rel)
                    .count(report.files_written.len()),
            );
            return Err(ConvertError::WritingOutput {
                source: e,
                path: rel,
                report: Box::new(report),
            });
        }
        debug!("commit: wrote {}", rel);
        report.files_written.push(rel);
    }
    Ok(report)
}
