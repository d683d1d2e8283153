// ********* Run parameters ***********

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The session assigned when neither the input nor the template says otherwise.
pub const DEFAULT_SESSION: &str = "ses-1";

/// The policy applied when two input rows normalize to the same subject identifier.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Abort the run and list every duplicated identifier.
    #[default]
    Error,
    /// Keep the first row of each identifier, drop the others.
    KeepFirst,
    /// Keep the last row of each identifier, drop the others.
    KeepLast,
    /// Every further occurrence of an identifier becomes a new session
    /// (`ses-2`, `ses-3`, ...) in encounter order.
    SplitToSessions,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "error" => Ok(DuplicatePolicy::Error),
            "keep_first" => Ok(DuplicatePolicy::KeepFirst),
            "keep_last" => Ok(DuplicatePolicy::KeepLast),
            "split_to_sessions" | "sessions" => Ok(DuplicatePolicy::SplitToSessions),
            x => Err(format!(
                "unknown duplicate policy {:?} (expected error, keep_first, keep_last or split_to_sessions)",
                x
            )),
        }
    }
}

/// All the parameters of one conversion run that the pure pipeline needs.
///
/// The structure is immutable for the duration of a run and passed by reference
/// through every stage.
#[derive(PartialEq, Debug, Clone)]
pub struct RunParameters {
    /// The name of the column holding the subject identifier.
    pub subject_column: String,
    /// The name of an explicit session column, if the input has one.
    pub session_column: Option<String>,
    pub duplicate_policy: DuplicatePolicy,
    /// If provided, only these templates (by key) take part in the run.
    pub instruments: Option<Vec<String>>,
    /// External identifier -> local identifier.
    pub id_map: BTreeMap<String, String>,
    /// Cell contents (trimmed, case-insensitive) that mean "no answer".
    pub missing_tokens: Vec<String>,
    /// Fraction of missing cells above which a subject/session is reported.
    pub missingness_threshold: f64,
    /// Maximum number of offending values quoted per column in the report.
    pub value_sample_limit: usize,
    /// Also plan one `task-<task>_survey.json` sidecar per task at the root
    /// of the dataset.
    pub dataset_sidecar: bool,
}

impl RunParameters {
    pub fn new(subject_column: &str) -> RunParameters {
        RunParameters {
            subject_column: subject_column.to_string(),
            session_column: None,
            duplicate_policy: DuplicatePolicy::Error,
            instruments: None,
            id_map: BTreeMap::new(),
            missing_tokens: default_missing_tokens(),
            missingness_threshold: 0.5,
            value_sample_limit: 5,
            dataset_sidecar: false,
        }
    }

    pub fn is_missing_token(&self, value: &str) -> bool {
        let v = value.trim();
        self.missing_tokens
            .iter()
            .any(|t| t.trim().eq_ignore_ascii_case(v))
    }
}

pub fn default_missing_tokens() -> Vec<String> {
    ["", "n/a", "na", "nan", "."]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// A cooperative cancellation flag, checked between the stages of a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ********* Input data structures ***********

/// The raw table handed to the pipeline, after reading and optional decoding.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct InputTable {
    /// A short description of where the data came from (file name).
    pub source: String,
    /// Digest of the raw bytes of the input.
    pub digest: String,
    pub headers: Vec<ColumnHeader>,
    /// All the data rows, each one padded to the number of headers.
    pub rows: Vec<Vec<String>>,
    /// The source declares closed answer sets for all its questions.
    pub strict_levels: bool,
}

impl InputTable {
    /// A table from plain headers. Short rows are padded with empty cells.
    pub fn new(source: &str, digest: &str, headers: &[String], rows: Vec<Vec<String>>) -> InputTable {
        let width = headers.len();
        InputTable {
            source: source.to_string(),
            digest: digest.to_string(),
            headers: headers.iter().map(|h| ColumnHeader::plain(h)).collect(),
            rows: rows
                .into_iter()
                .map(|mut r| {
                    if r.len() < width {
                        r.resize(width, String::new());
                    }
                    r
                })
                .collect(),
            strict_levels: false,
        }
    }
}

/// One column header. `decoded` holds the candidate names an archive decoder
/// inferred for the raw header, best first; it is empty for plain headers.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ColumnHeader {
    pub raw: String,
    pub decoded: Vec<String>,
}

impl ColumnHeader {
    pub fn plain(raw: &str) -> ColumnHeader {
        ColumnHeader {
            raw: raw.to_string(),
            decoded: Vec::new(),
        }
    }
}

/// The identity of a canonical item: the template it belongs to and its id.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd, Serialize)]
pub struct ItemRef {
    pub template: String,
    pub item_id: String,
}

impl ItemRef {
    pub fn new(template: &str, item_id: &str) -> ItemRef {
        ItemRef {
            template: template.to_string(),
            item_id: item_id.to_string(),
        }
    }
}

impl Display for ItemRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.template, self.item_id)
    }
}

// ******** Issues *********

#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize, Hash, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    // Template library
    TemplateInvalid,
    TemplateShadowed,
    MissingTranslation,
    AliasCycle,
    AliasTargetMissing,
    DuplicateItemId,
    InstrumentNotFound,
    AliasResolved,
    // Classification
    NormalizedMatch,
    DefaultSession,
    ArchiveFieldDecoded,
    AmbiguousColumn,
    DuplicateMapping,
    UnmatchedColumn,
    NoItemsMatched,
    // Sessions and duplicates
    MissingSubjectColumn,
    MissingSessionColumn,
    EmptySubjectId,
    EmptySession,
    IdRemapped,
    DuplicateSubject,
    DuplicateDropped,
    SessionSplit,
    CellConflict,
    // Values
    UnexpectedValue,
    OutOfRange,
    HighMissingness,
    LevelsBoundsConflict,
    // Run level
    Cancelled,
    OutputConflict,
    WriteFailed,
    ParticipantsMapping,
}

/// The place in the input an issue refers to. Only the relevant fields are set.
#[derive(PartialEq, Debug, Clone, Default, Serialize)]
pub struct IssueContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// 1-based data row, not counting the header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// The input declares the answers of every question.
    #[serde(skip_serializing_if = "is_false")]
    pub strict: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(PartialEq, Debug, Clone, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub code: IssueCode,
    pub message: String,
    pub context: IssueContext,
}

impl Issue {
    pub fn new(severity: Severity, code: IssueCode, message: impl Into<String>) -> Issue {
        Issue {
            severity,
            code,
            message: message.into(),
            context: IssueContext::default(),
        }
    }

    pub fn error(code: IssueCode, message: impl Into<String>) -> Issue {
        Issue::new(Severity::Error, code, message)
    }

    pub fn warning(code: IssueCode, message: impl Into<String>) -> Issue {
        Issue::new(Severity::Warning, code, message)
    }

    pub fn info(code: IssueCode, message: impl Into<String>) -> Issue {
        Issue::new(Severity::Info, code, message)
    }

    pub fn column(mut self, column: &str) -> Issue {
        self.context.column = Some(column.to_string());
        self
    }

    pub fn item(mut self, item: &ItemRef) -> Issue {
        self.context.template = Some(item.template.clone());
        self.context.item_id = Some(item.item_id.clone());
        self
    }

    pub fn template(mut self, template: &str) -> Issue {
        self.context.template = Some(template.to_string());
        self
    }

    pub fn subject(mut self, subject: &str) -> Issue {
        self.context.subject = Some(subject.to_string());
        self
    }

    pub fn session(mut self, session: &str) -> Issue {
        self.context.session = Some(session.to_string());
        self
    }

    pub fn row(mut self, row: usize) -> Issue {
        self.context.row = Some(row);
        self
    }

    pub fn count(mut self, count: usize) -> Issue {
        self.context.count = Some(count);
        self
    }

    pub fn values(mut self, values: Vec<String>) -> Issue {
        self.context.values = values;
        self
    }

    pub fn candidates(mut self, candidates: Vec<String>) -> Issue {
        self.context.candidates = candidates;
        self
    }

    pub fn file(mut self, file: &str) -> Issue {
        self.context.file = Some(file.to_string());
        self
    }

    pub fn strict(mut self, strict: bool) -> Issue {
        self.context.strict = strict;
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

// ******** Output data structures *********

#[derive(PartialEq, Debug, Clone, Default, Serialize)]
pub struct ReportSummary {
    /// Rows carrying a subject identifier.
    pub participants: usize,
    /// Distinct normalized subjects that end up in the output.
    pub unique_participants: usize,
    pub tasks: Vec<String>,
    pub sessions: Vec<String>,
    pub files_to_create: usize,
}

#[derive(PartialEq, Debug, Clone, Serialize)]
pub struct ColumnMappingEntry {
    pub raw_column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded_name: Option<String>,
    pub task: String,
    pub item_id: String,
    /// `None` when the session is taken from the row (session column or
    /// duplicate splitting).
    pub session: Option<String>,
    pub run: Option<u32>,
    pub missing_pct: f64,
}

#[derive(PartialEq, Debug, Clone, Serialize)]
pub struct ParticipantPreview {
    pub subject: String,
    pub session: String,
    pub raw_id: String,
    pub completeness_pct: f64,
}

/// The structured outcome of a run. It is the same in preview and in commit
/// mode, except for `files_written`.
#[derive(PartialEq, Debug, Clone, Default, Serialize)]
pub struct ConversionReport {
    pub source: String,
    pub input_digest: String,
    pub summary: ReportSummary,
    pub issues: Vec<Issue>,
    pub column_mapping: Vec<ColumnMappingEntry>,
    pub unmatched_columns: Vec<String>,
    pub participant_preview: Vec<ParticipantPreview>,
    pub files_written: Vec<String>,
}

impl ConversionReport {
    pub fn errors(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.is_error())
    }

    pub fn issues_with_code(&self, code: IssueCode) -> Vec<&Issue> {
        self.issues.iter().filter(|i| i.code == code).collect()
    }
}

/// The stages of a conversion run.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStage {
    LoadingTemplates,
    ClassifyingColumns,
    ResolvingSessions,
    ValidatingRows,
    Preview,
    WritingOutput,
    Done,
    Aborted,
}

impl Display for ConversionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConversionStage::LoadingTemplates => "loading templates",
            ConversionStage::ClassifyingColumns => "classifying columns",
            ConversionStage::ResolvingSessions => "resolving sessions",
            ConversionStage::ValidatingRows => "validating rows",
            ConversionStage::Preview => "preview",
            ConversionStage::WritingOutput => "writing output",
            ConversionStage::Done => "done",
            ConversionStage::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// A run that reached the `Aborted` state.
///
/// `report.issues` holds every issue accumulated up to the abort, the fatal
/// ones included; `fatal` repeats the issues that caused the abort.
#[derive(PartialEq, Debug, Clone)]
pub struct ConversionAborted {
    /// The stage in which the fatal condition was raised.
    pub stage: ConversionStage,
    pub fatal: Vec<Issue>,
    pub report: ConversionReport,
}

impl ConversionAborted {
    pub fn has_fatal(&self, code: IssueCode) -> bool {
        self.fatal.iter().any(|i| i.code == code)
    }
}

impl Error for ConversionAborted {}

impl Display for ConversionAborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msgs: Vec<String> = self
            .fatal
            .iter()
            .map(|i| format!("{:?}: {}", i.code, i.message))
            .collect();
        write!(f, "conversion aborted while {}: {}", self.stage, msgs.join("; "))
    }
}
