//! The format-agnostic side of archive decoding.
//!
//! Survey platforms export each question under an internal field code that has
//! nothing to do with the item ids of the instrument. A [`StructureDecoder`]
//! reads the structure document of such an export and proposes candidate
//! names for those codes. The proposals are advisory: the classifier still
//! matches them against the template library like any other column name.

use std::collections::HashMap;
use std::error::Error;
use std::fmt::Display;

use log::{debug, info};

use crate::config::{ColumnHeader, Issue, IssueCode};

/// What the structure document says about one field, beyond its name.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct FieldHints {
    /// The platform's question type code.
    pub question_type: Option<String>,
    pub mandatory: bool,
    /// The answer codes offered by the question, if it is a closed question.
    pub answer_codes: Vec<String>,
    /// The question text in the document language.
    pub text: Option<String>,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct DecodedField {
    /// The opaque code used as column header in the response data.
    pub code: String,
    /// The best guess for the item id.
    pub candidate_name: String,
    /// Further guesses, tried after `candidate_name`.
    pub alternates: Vec<String>,
    pub language: Option<String>,
    pub hints: FieldHints,
}

/// Document-level technical metadata.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct ArchiveMetadata {
    pub title: Option<String>,
    /// The detected content language.
    pub language: Option<String>,
    /// All the decoded questions restrict their answers to declared codes:
    /// unexpected values are likely real errors rather than free text.
    pub strict_levels: bool,
}

#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct DecodedStructure {
    pub fields: Vec<DecodedField>,
    pub metadata: ArchiveMetadata,
}

impl DecodedStructure {
    /// Builds the structure and derives the document-level hints from the
    /// fields.
    pub fn new(fields: Vec<DecodedField>, title: Option<String>, language: Option<String>) -> Self {
        let strict_levels =
            !fields.is_empty() && fields.iter().all(|f| !f.hints.answer_codes.is_empty());
        DecodedStructure {
            fields,
            metadata: ArchiveMetadata {
                title,
                language,
                strict_levels,
            },
        }
    }

    fn by_code(&self) -> HashMap<String, &DecodedField> {
        self.fields
            .iter()
            .map(|f| (field_key(&f.code), f))
            .collect()
    }
}

/// A decoder for one export format.
pub trait StructureDecoder {
    /// A short name of the format, for logging.
    fn format_name(&self) -> &str;

    /// Reads the structure of an export.
    fn decode(&self, archive: &[u8]) -> Result<DecodedStructure, DecodeError>;
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum DecodeError {
    /// The archive could not be read at all.
    Unreadable(String),
    /// The archive was read but does not look like an export of this format.
    Unrecognized(String),
}

impl Error for DecodeError {}

impl Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Unreadable(m) => write!(f, "cannot read archive: {}", m),
            DecodeError::Unrecognized(m) => write!(f, "unrecognized export structure: {}", m),
        }
    }
}

// Response documents may prefix codes with an underscore and exports vary in case.
fn field_key(code: &str) -> String {
    code.trim().trim_start_matches('_').to_uppercase()
}

/// Attaches the candidate names of a decoded structure to raw headers.
///
/// Headers that are not field codes are kept as they are.
pub fn decode_headers(
    headers: &[String],
    structure: &DecodedStructure,
    issues: &mut Vec<Issue>,
) -> Vec<ColumnHeader> {
    let by_code = structure.by_code();
    let mut decoded_count = 0;
    let res: Vec<ColumnHeader> = headers
        .iter()
        .map(|h| match by_code.get(&field_key(h)) {
            Some(f) => {
                decoded_count += 1;
                let mut names = vec![f.candidate_name.clone()];
                names.extend(f.alternates.iter().cloned());
                debug!("decode_headers: {} -> {:?}", h, names);
                ColumnHeader {
                    raw: h.clone(),
                    decoded: names,
                }
            }
            None => ColumnHeader::plain(h),
        })
        .collect();
    info!(
        "Decoded {} of {} columns (language {:?}, strict levels: {})",
        decoded_count,
        headers.len(),
        structure.metadata.language,
        structure.metadata.strict_levels
    );
    if decoded_count > 0 {
        issues.push(
            Issue::info(
                IssueCode::ArchiveFieldDecoded,
                format!(
                    "{} of {} columns decoded from the survey structure",
                    decoded_count,
                    headers.len()
                ),
            )
            .count(decoded_count),
        );
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(code: &str, name: &str, answers: &[&str]) -> DecodedField {
        DecodedField {
            code: code.to_string(),
            candidate_name: name.to_string(),
            alternates: vec![],
            language: Some("en".to_string()),
            hints: FieldHints {
                answer_codes: answers.iter().map(|s| s.to_string()).collect(),
                ..FieldHints::default()
            },
        }
    }

    #[test]
    fn decodes_known_codes_only() {
        let s = DecodedStructure::new(
            vec![field("123X4X5", "WB01", &["0", "1"]), field("123X4X6", "WB02", &[])],
            None,
            Some("en".to_string()),
        );
        assert!(!s.metadata.strict_levels);
        let mut issues = Vec::new();
        let headers = vec!["id".to_string(), "_123x4x5".to_string(), "999X1X1".to_string()];
        let cols = decode_headers(&headers, &s, &mut issues);
        assert_eq!(cols[0], ColumnHeader::plain("id"));
        assert_eq!(cols[1].decoded, vec!["WB01".to_string()]);
        assert!(cols[2].decoded.is_empty());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].context.count, Some(1));
    }

    #[test]
    fn strict_levels_hint() {
        let s = DecodedStructure::new(vec![field("1X1X1", "A", &["1"])], None, None);
        assert!(s.metadata.strict_levels);
        assert!(!DecodedStructure::new(vec![], None, None).metadata.strict_levels);
    }
}
