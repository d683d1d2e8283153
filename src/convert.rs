use log::{debug, info, warn};

use instrument_core::*;
use snafu::{prelude::*, Snafu};

use std::fs;

use serde_json::Value as JSValue;
use text_diff::print_diff;

use crate::args::Args;

mod config_reader;
mod io_common;
mod io_csv;
mod io_excel;
mod io_limesurvey;
mod template_files;
mod writer;

pub use crate::convert::config_reader::*;
use crate::convert::io_common::InputType;
use crate::convert::io_limesurvey::LimeSurveyDecoder;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConvertError {
    #[snafu(display("Error opening file {path}"))]
    OpeningExcel {
        source: calamine::Error,
        path: String,
    },
    #[snafu(display("Worksheet {name:?} not found in {path}"))]
    MissingWorksheet { name: String, path: String },
    #[snafu(display("The workbook {path} has no usable worksheet, or several without a worksheet name"))]
    EmptyExcel { path: String },
    #[snafu(display("Error opening csv file {path}"))]
    OpeningCsv { source: csv::Error, path: String },
    #[snafu(display("Error parsing line {lineno} of {path}"))]
    CsvLineParse {
        source: csv::Error,
        path: String,
        lineno: usize,
    },
    #[snafu(display("Line {lineno} of {path} has {found} cells, the header only has {expected}"))]
    CsvLineTooLong {
        path: String,
        lineno: usize,
        found: usize,
        expected: usize,
    },
    #[snafu(display("Line {lineno} of {path} is too short"))]
    CsvLineTooShort { path: String, lineno: usize },
    #[snafu(display("The file {path} has no header row"))]
    EmptyInput { path: String },
    #[snafu(display("Error reading file {path}"))]
    OpeningFile {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing JSON file {path}"))]
    ParsingJson {
        source: serde_json::Error,
        path: String,
    },
    #[snafu(display("Error opening archive {path}"))]
    OpeningArchive {
        source: zip::result::ZipError,
        path: String,
    },
    #[snafu(display("The archive {path} has no {member} document"))]
    MissingArchiveMember { path: String, member: String },
    #[snafu(display("Error parsing XML document {path}"))]
    ParsingXml {
        source: quick_xml::Error,
        path: String,
    },
    #[snafu(display("Error decoding the survey structure in {path}"))]
    DecodingArchive { source: DecodeError, path: String },
    #[snafu(display("Cannot guess the type of input {path}, use inputType"))]
    UnknownInputType { path: String },
    #[snafu(display("Missing option {name}"))]
    MissingOption { name: String },
    #[snafu(display("Invalid option {name}: {message}"))]
    InvalidOption { name: String, message: String },
    #[snafu(display("Template library {path} does not exist"))]
    MissingLibrary { path: String },
    #[snafu(display("Error scanning template library {path}"))]
    ScanningLibrary {
        source: walkdir::Error,
        path: String,
    },
    #[snafu(display("Error scanning output directory {directory}"))]
    ScanningOutput {
        source: walkdir::Error,
        directory: String,
    },
    #[snafu(context(false), display("{source}"))]
    Aborted {
        #[snafu(source(from(ConversionAborted, Box::new)))]
        source: Box<ConversionAborted>,
    },
    #[snafu(display(
        "{} files already exist in {directory}, use overwrite to replace them",
        conflicts.len()
    ))]
    OutputConflict {
        directory: String,
        conflicts: Vec<String>,
        report: Box<ConversionReport>,
    },
    #[snafu(display("Error writing {path}, {} files were written before", report.files_written.len()))]
    WritingOutput {
        source: std::io::Error,
        path: String,
        report: Box<ConversionReport>,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

pub type ConvertResult<T> = Result<T, ConvertError>;

impl ConvertError {
    /// The report accumulated by a run that failed after reading its inputs.
    pub fn report(&self) -> Option<&ConversionReport> {
        match self {
            ConvertError::Aborted { source } => Some(&source.report),
            ConvertError::OutputConflict { report, .. } => Some(report),
            ConvertError::WritingOutput { report, .. } => Some(report),
            _ => None,
        }
    }
}

fn read_input(ctx: &RunContext, issues: &mut Vec<Issue>) -> ConvertResult<InputTable> {
    let path = ctx.input.display().to_string();
    info!("Reading {:?} input {}", ctx.input_type, path);
    let mut table = match ctx.input_type {
        InputType::Csv => io_csv::read_csv_table(&path, ctx.delimiter)?,
        InputType::Excel => io_excel::read_excel_table(&path, ctx.worksheet.as_deref())?,
        InputType::Lsa => io_limesurvey::read_archive(&path, issues)?,
    };
    if let Some(structure_p) = ctx.archive_structure.as_ref() {
        let structure_path = structure_p.display().to_string();
        let bytes = fs::read(structure_p).context(OpeningFileSnafu {
            path: structure_path.clone(),
        })?;
        let decoder = LimeSurveyDecoder {};
        let structure = decoder.decode(&bytes).context(DecodingArchiveSnafu {
            path: structure_path,
        })?;
        let raw: Vec<String> = table.headers.iter().map(|h| h.raw.clone()).collect();
        table.headers = decode_headers(&raw, &structure, issues);
        table.strict_levels = structure.metadata.strict_levels;
    }
    debug!(
        "read_input: {} columns, {} rows, digest {}",
        table.headers.len(),
        table.rows.len(),
        table.digest
    );
    Ok(table)
}

/// Runs one conversion: reads the library and the input, plans the output and,
/// unless this is a dry run, writes it.
///
/// The returned report is the same in both modes, up to `files_written`.
pub fn run_conversion(ctx: &RunContext, cancel: &CancelToken) -> ConvertResult<ConversionReport> {
    let (templates, mut issues) = template_files::load_templates(&ctx.library_paths)?;
    let table = read_input(ctx, &mut issues)?;

    let mut plan = plan_conversion(&table, templates, issues, &ctx.params, cancel)?;

    let participants = match ctx.participants_mapping.as_ref() {
        Some(p) => {
            let mapping = writer::read_participants_mapping(p)?;
            Some(writer::participants_table(
                &mut plan,
                &table,
                &mapping,
                &ctx.params,
            ))
        }
        None => None,
    };

    if ctx.dry_run {
        info!(
            "Dry run: {} files would be written",
            plan.report.summary.files_to_create
        );
        return Ok(plan.report);
    }

    if cancel.is_cancelled() {
        let issue = Issue::error(
            IssueCode::Cancelled,
            format!("the run was cancelled before {}", ConversionStage::WritingOutput),
        );
        let mut report = plan.report;
        report.issues.push(issue.clone());
        return Err(ConversionAborted {
            stage: ConversionStage::WritingOutput,
            fatal: vec![issue],
            report,
        }
        .into());
    }

    let output_directory = ctx
        .output_directory
        .as_ref()
        .context(MissingOptionSnafu {
            name: "outputDirectory",
        })?;
    info!("Stage: {}", ConversionStage::WritingOutput);
    let report = writer::commit(output_directory, ctx.overwrite, &plan, participants.as_ref())?;
    info!(
        "Stage: {}: {} files written to {}",
        ConversionStage::Done,
        report.files_written.len(),
        output_directory.display()
    );
    Ok(report)
}

fn read_reference(path: &str) -> ConvertResult<JSValue> {
    let contents = fs::read_to_string(path).context(OpeningFileSnafu { path })?;
    let js: JSValue = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu { path })?;
    Ok(js)
}

fn write_report(out: Option<&str>, pretty: &str) -> ConvertResult<()> {
    match out {
        None | Some("") | Some("stdout") => {
            println!("{}", pretty);
            Ok(())
        }
        Some(path) => {
            info!("Writing report to {}", path);
            fs::write(path, pretty).context(OpeningFileSnafu { path })
        }
    }
}

pub fn run_cli(args: &Args) -> ConvertResult<()> {
    let ctx = RunContext::from_args(args)?;
    debug!("run_cli: context: {:?}", ctx);
    let cancel = CancelToken::new();
    let res = run_conversion(&ctx, &cancel);

    let report = match &res {
        Ok(r) => Some(r),
        Err(e) => e.report(),
    };
    let mut mismatch = false;
    if let Some(r) = report {
        let pretty_js = serde_json::to_string_pretty(r).context(ParsingJsonSnafu { path: "report" })?;
        write_report(args.out.as_deref(), &pretty_js)?;

        // The reference report, if provided for comparison
        if let Some(reference_p) = args.reference.as_ref() {
            let reference = read_reference(reference_p)?;
            let pretty_js_reference = serde_json::to_string_pretty(&reference)
                .context(ParsingJsonSnafu { path: reference_p })?;
            if pretty_js_reference != pretty_js {
                warn!("Found differences with the reference report");
                print_diff(pretty_js_reference.as_str(), pretty_js.as_str(), "\n");
                mismatch = true;
            }
        }
    }

    res?;
    if mismatch {
        whatever!("Difference detected between the produced report and the reference report")
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use tempfile::TempDir;

    pub(crate) const WELLBEING: &str = r#"{
  "Study": {"OriginalName": "WHO-5", "ShortName": "wellbeing", "Languages": ["en"]},
  "WB01": {"Description": {"en": "cheerful"}, "Levels": {"0": "never", "1": "sometimes", "2": "always"}},
  "WB02": {"Description": {"en": "calm"}, "Levels": {"0": "never", "1": "sometimes", "2": "always"}, "Reversed": true}
}"#;

    pub(crate) struct Fixture {
        pub dir: TempDir,
    }

    impl Fixture {
        pub fn new(csv: &str) -> Fixture {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(dir.path().join("library")).unwrap();
            fs::write(dir.path().join("library/survey-wellbeing.json"), WELLBEING).unwrap();
            fs::write(dir.path().join("input.csv"), csv).unwrap();
            Fixture { dir }
        }

        pub fn context(&self, dry_run: bool) -> RunContext {
            let args = Args {
                input: Some(self.path("input.csv")),
                library: vec![self.path("library")],
                subject_column: Some("ID".to_string()),
                output_directory: Some(self.path("out")),
                dry_run,
                ..Args::default()
            };
            RunContext::from_args(&args).unwrap()
        }

        pub fn path(&self, p: &str) -> String {
            self.dir.path().join(p).display().to_string()
        }
    }

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn preview_and_commit_reports_match() {
        init();
        let f = Fixture::new("ID,WB01,WB02,age\nP1,0,2,31\nP2,1,,40\nP3,2,7,\n");
        let cancel = CancelToken::new();
        let preview = run_conversion(&f.context(true), &cancel).unwrap();
        assert!(!Path::new(&f.path("out")).exists());

        let mut commit = run_conversion(&f.context(false), &cancel).unwrap();
        assert_eq!(commit.files_written.len(), preview.summary.files_to_create);
        commit.files_written.clear();
        assert_eq!(preview, commit);
        assert_eq!(preview.issues_with_code(IssueCode::UnexpectedValue).len(), 1);
        assert_eq!(preview.unmatched_columns, vec!["age".to_string()]);
    }

    #[test]
    fn commit_writes_data_and_sidecars() {
        let f = Fixture::new("ID,WB01,WB02\nP1,0,2\n");
        let report = run_conversion(&f.context(false), &CancelToken::new()).unwrap();
        assert_eq!(
            report.files_written,
            vec![
                "sub-p1/ses-1/survey/sub-p1_ses-1_task-wellbeing_survey.tsv".to_string(),
                "sub-p1/ses-1/survey/sub-p1_ses-1_task-wellbeing_survey.json".to_string(),
            ]
        );
        let tsv = fs::read_to_string(f.path(
            "out/sub-p1/ses-1/survey/sub-p1_ses-1_task-wellbeing_survey.tsv",
        ))
        .unwrap();
        assert_eq!(tsv, "WB01\tWB02\n0\t2\n");
        let sidecar: JSValue = serde_json::from_str(
            &fs::read_to_string(f.path(
                "out/sub-p1/ses-1/survey/sub-p1_ses-1_task-wellbeing_survey.json",
            ))
            .unwrap(),
        )
        .unwrap();
        assert_eq!(sidecar["Study"]["ShortName"], "wellbeing");
        assert_eq!(sidecar["WB02"]["Reversed"], true);
    }

    #[test]
    fn existing_files_are_not_overwritten() {
        let f = Fixture::new("ID,WB01\nP1,0\n");
        run_conversion(&f.context(false), &CancelToken::new()).unwrap();
        let err = run_conversion(&f.context(false), &CancelToken::new()).unwrap_err();
        match &err {
            ConvertError::OutputConflict { conflicts, .. } => assert_eq!(conflicts.len(), 2),
            e => panic!("unexpected error {:?}", e),
        }
        let report = err.report().unwrap();
        assert_eq!(report.issues_with_code(IssueCode::OutputConflict).len(), 1);
        assert!(report.files_written.is_empty());

        let mut ctx = f.context(false);
        ctx.overwrite = true;
        let report = run_conversion(&ctx, &CancelToken::new()).unwrap();
        assert_eq!(report.files_written.len(), 2);
    }

    #[test]
    fn fatal_issues_reach_the_caller() {
        let f = Fixture::new("ID,WB01\nP1,0\np1,1\n");
        let err = run_conversion(&f.context(true), &CancelToken::new()).unwrap_err();
        let report = err.report().unwrap();
        assert_eq!(report.issues_with_code(IssueCode::DuplicateSubject).len(), 1);
        match err {
            ConvertError::Aborted { source } => {
                assert_eq!(source.stage, ConversionStage::ResolvingSessions)
            }
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn archive_columns_are_decoded() {
        init();
        let f = Fixture::new("");
        let archive = f.dir.path().join("survey_123456.lsa");
        io_limesurvey::tests::write_archive(&archive);
        let args = Args {
            input: Some(archive.display().to_string()),
            library: vec![f.path("library")],
            subject_column: Some("id".to_string()),
            dry_run: true,
            ..Args::default()
        };
        let ctx = RunContext::from_args(&args).unwrap();
        assert_eq!(ctx.input_type, InputType::Lsa);
        let report = run_conversion(&ctx, &CancelToken::new()).unwrap();
        let mapped: Vec<(&str, Option<&str>)> = report
            .column_mapping
            .iter()
            .map(|m| (m.raw_column.as_str(), m.decoded_name.as_deref()))
            .collect();
        assert_eq!(
            mapped,
            vec![
                ("123456X7X10WB01", Some("WB01")),
                ("123456X7X10WB02", Some("WB02"))
            ]
        );
        assert_eq!(report.unmatched_columns, vec!["123456X7X11".to_string()]);
        assert_eq!(report.issues_with_code(IssueCode::ArchiveFieldDecoded).len(), 1);
        assert_eq!(report.source, "survey_123456.lsa");
    }

    #[test]
    fn reference_report_is_checked() {
        let f = Fixture::new("ID,WB01\nP1,0\n");
        let args = Args {
            input: Some(f.path("input.csv")),
            library: vec![f.path("library")],
            subject_column: Some("ID".to_string()),
            dry_run: true,
            out: Some(f.path("report.json")),
            ..Args::default()
        };
        run_cli(&args).unwrap();
        let written = fs::read_to_string(f.path("report.json")).unwrap();
        assert!(written.contains("\"files_to_create\": 2"));

        let args = Args {
            reference: Some(f.path("report.json")),
            out: Some(f.path("report2.json")),
            ..args
        };
        run_cli(&args).unwrap();

        fs::write(f.path("input.csv"), "ID,WB01\nP1,1\n").unwrap();
        assert!(run_cli(&args).is_err());
    }
}
