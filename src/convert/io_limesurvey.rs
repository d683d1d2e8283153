//! Reader for LimeSurvey exports.
//!
//! Both the structure (`.lss`) and the response (`.lsr`) documents share the
//! same layout:
//!
//! ```xml
//! <document>
//!  <LimeSurveyDocType>Survey</LimeSurveyDocType>
//!  <languages><language>en</language></languages>
//!  <questions>
//!   <fields><fieldname>qid</fieldname>...</fields>
//!   <rows><row><qid><![CDATA[12]]></qid>...</row></rows>
//!  </questions>
//! </document>
//! ```
//!
//! A response archive (`.lsa`) is a zip file holding one document of each kind.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use zip::ZipArchive;

use crate::convert::io_common::{input_digest, simplify_file_name};
use crate::convert::*;

/// One table of a document.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct XmlSection {
    pub fields: Vec<String>,
    pub rows: Vec<BTreeMap<String, String>>,
}

#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct XmlDocument {
    pub sections: BTreeMap<String, XmlSection>,
    /// Plain values directly under the root or one level below, keyed by
    /// their path (`LimeSurveyDocType`, `languages/language`).
    pub values: BTreeMap<String, Vec<String>>,
}

impl XmlDocument {
    pub fn rows(&self, section: &str) -> &[BTreeMap<String, String>] {
        self.sections
            .get(section)
            .map(|s| s.rows.as_slice())
            .unwrap_or(&[])
    }

    pub fn value(&self, path: &str) -> Option<&str> {
        self.values
            .get(path)
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }
}

// Element names of the response rows carry a `_` prefix when the field code
// starts with a digit.
fn field_name(element: &str) -> String {
    match element.strip_prefix('_') {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest.to_string(),
        _ => element.to_string(),
    }
}

pub fn read_document(bytes: &[u8]) -> Result<XmlDocument, quick_xml::Error> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);
    let mut doc = XmlDocument::default();
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut row: BTreeMap<String, String> = BTreeMap::new();
    let mut buf: Vec<u8> = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                stack.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                text.clear();
            }
            Event::Empty(e) => {
                // <field/> inside a row: an empty value
                if stack.len() == 4 && stack[2] == "rows" {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    row.insert(field_name(&name), String::new());
                }
            }
            Event::Text(e) => text.push_str(&e.unescape()?),
            Event::CData(e) => text.push_str(&String::from_utf8_lossy(&e.into_inner())),
            Event::End(_) => {
                let name = stack.pop().unwrap_or_default();
                match stack.len() {
                    // document/section/rows/row/<field>
                    4 if stack[2] == "rows" => {
                        row.insert(field_name(&name), std::mem::take(&mut text));
                    }
                    // document/section/rows/row
                    3 if stack[2] == "rows" && name == "row" => {
                        doc.sections
                            .entry(stack[1].clone())
                            .or_default()
                            .rows
                            .push(std::mem::take(&mut row));
                    }
                    // document/section/fields/fieldname
                    3 if stack[2] == "fields" => {
                        doc.sections
                            .entry(stack[1].clone())
                            .or_default()
                            .fields
                            .push(std::mem::take(&mut text));
                    }
                    1 | 2 if !text.is_empty() => {
                        let mut path: Vec<&str> = stack[1..].iter().map(|s| s.as_str()).collect();
                        path.push(&name);
                        doc.values
                            .entry(path.join("/"))
                            .or_default()
                            .push(std::mem::take(&mut text));
                    }
                    _ => text.clear(),
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    debug!(
        "read_document: sections: {:?}",
        doc.sections
            .iter()
            .map(|(k, s)| (k.as_str(), s.rows.len()))
            .collect::<Vec<_>>()
    );
    Ok(doc)
}

// Question types with a built-in answer set.
fn builtin_answers(question_type: &str) -> Vec<String> {
    let codes: &[&str] = match question_type {
        "Y" => &["Y", "N"],
        "G" => &["F", "M"],
        "C" => &["Y", "N", "U"],
        "E" => &["I", "S", "D"],
        "5" | "A" => &["1", "2", "3", "4", "5"],
        "B" => &["1", "2", "3", "4", "5", "6", "7", "8", "9", "10"],
        _ => &[],
    };
    codes.iter().map(|s| s.to_string()).collect()
}

fn get<'a>(row: &'a BTreeMap<String, String>, key: &str) -> &'a str {
    row.get(key).map(|s| s.trim()).unwrap_or("")
}

// Structure documents repeat each row once per survey language (older
// exports) or keep the texts in separate *_l10ns tables (newer ones).
fn in_language(row: &BTreeMap<String, String>, language: Option<&str>) -> bool {
    match (row.get("language"), language) {
        (Some(l), Some(lang)) => l.trim() == lang,
        _ => true,
    }
}

/// Decodes the structure document of a LimeSurvey export.
///
/// Field codes are `<sid>X<gid>X<qid>` for plain questions and
/// `<sid>X<gid>X<parent qid><subquestion title>` for array questions.
pub struct LimeSurveyDecoder {}

impl LimeSurveyDecoder {
    fn decode_document(&self, doc: &XmlDocument) -> Result<DecodedStructure, DecodeError> {
        let doc_type = doc.value("LimeSurveyDocType").unwrap_or("Survey");
        if doc_type != "Survey" {
            return Err(DecodeError::Unrecognized(format!(
                "expected a survey structure, found a {} document",
                doc_type
            )));
        }
        if doc.rows("questions").is_empty() {
            return Err(DecodeError::Unrecognized(
                "the document has no questions".to_string(),
            ));
        }

        let survey = doc.rows("surveys").first();
        let language: Option<String> = survey
            .map(|s| get(s, "language"))
            .filter(|l| !l.is_empty())
            .or_else(|| doc.value("languages/language"))
            .map(|s| s.to_string());
        let lang = language.as_deref();
        let survey_sid = survey.map(|s| get(s, "sid")).unwrap_or("");

        let title = doc
            .rows("surveys_languagesettings")
            .iter()
            .find(|r| {
                lang.map(|l| get(r, "surveyls_language") == l)
                    .unwrap_or(true)
            })
            .map(|r| get(r, "surveyls_title").to_string())
            .filter(|t| !t.is_empty());

        // Question texts of the newer exports.
        let mut texts: HashMap<&str, &str> = HashMap::new();
        for r in doc.rows("question_l10ns") {
            if in_language(r, lang) {
                texts.entry(get(r, "qid")).or_insert(get(r, "question"));
            }
        }

        let mut answers: HashMap<&str, Vec<String>> = HashMap::new();
        for r in doc.rows("answers") {
            if in_language(r, lang) {
                let codes = answers.entry(get(r, "qid")).or_default();
                let code = get(r, "code").to_string();
                if !codes.contains(&code) {
                    codes.push(code);
                }
            }
        }

        // Questions and subquestions, once per qid.
        let mut seen: HashSet<&str> = HashSet::new();
        let mut questions: Vec<&BTreeMap<String, String>> = Vec::new();
        let mut children: HashMap<&str, Vec<&BTreeMap<String, String>>> = HashMap::new();
        for r in doc.rows("questions").iter().chain(doc.rows("subquestions")) {
            if !in_language(r, lang) || !seen.insert(get(r, "qid")) {
                continue;
            }
            match get(r, "parent_qid") {
                "" | "0" => questions.push(r),
                parent => children.entry(parent).or_default().push(r),
            }
        }

        let mut fields: Vec<DecodedField> = Vec::new();
        for q in questions.iter() {
            let qid = get(q, "qid");
            let sid = match get(q, "sid") {
                "" => survey_sid,
                s => s,
            };
            let prefix = format!("{}X{}X{}", sid, get(q, "gid"), qid);
            let question_type = get(q, "type");
            let title = get(q, "title");
            let mut codes = answers.get(qid).cloned().unwrap_or_default();
            if codes.is_empty() {
                codes = builtin_answers(question_type);
            }
            let text = match get(q, "question") {
                "" => texts.get(qid).map(|s| s.to_string()),
                s => Some(s.to_string()),
            };
            let hints = FieldHints {
                question_type: Some(question_type.to_string()).filter(|s| !s.is_empty()),
                mandatory: get(q, "mandatory") == "Y",
                answer_codes: codes,
                text,
            };
            match children.get(qid) {
                Some(subs) => {
                    for sub in subs.iter() {
                        let sub_title = get(sub, "title");
                        fields.push(DecodedField {
                            code: format!("{}{}", prefix, sub_title),
                            candidate_name: sub_title.to_string(),
                            alternates: vec![format!("{}{}", title, sub_title)],
                            language: language.clone(),
                            hints: hints.clone(),
                        });
                    }
                }
                None => fields.push(DecodedField {
                    code: prefix,
                    candidate_name: title.to_string(),
                    alternates: vec![],
                    language: language.clone(),
                    hints,
                }),
            }
        }
        debug!(
            "LimeSurveyDecoder: {} questions, {} fields, language {:?}",
            questions.len(),
            fields.len(),
            language
        );
        Ok(DecodedStructure::new(fields, title, language))
    }
}

impl StructureDecoder for LimeSurveyDecoder {
    fn format_name(&self) -> &str {
        "limesurvey"
    }

    fn decode(&self, archive: &[u8]) -> Result<DecodedStructure, DecodeError> {
        let doc = read_document(archive).map_err(|e| DecodeError::Unreadable(e.to_string()))?;
        self.decode_document(&doc)
    }
}

/// Reads a response document: the headers are the field codes, in the order
/// the document declares them.
pub fn read_responses(bytes: &[u8]) -> Result<(Vec<String>, Vec<Vec<String>>), quick_xml::Error> {
    let doc = read_document(bytes)?;
    let section = doc.sections.get("responses").cloned().unwrap_or_default();
    let mut headers: Vec<String> = section.fields.iter().map(|f| field_name(f)).collect();
    if headers.is_empty() {
        for r in section.rows.iter() {
            for k in r.keys() {
                if !headers.contains(k) {
                    headers.push(k.clone());
                }
            }
        }
    }
    let rows: Vec<Vec<String>> = section
        .rows
        .iter()
        .map(|r| {
            headers
                .iter()
                .map(|h| r.get(h).cloned().unwrap_or_default())
                .collect()
        })
        .collect();
    Ok((headers, rows))
}

fn read_member(
    zip: &mut ZipArchive<Cursor<&[u8]>>,
    names: &[String],
    extension: &str,
    path: &str,
) -> ConvertResult<Vec<u8>> {
    let name = names
        .iter()
        .find(|n| n.to_lowercase().ends_with(extension))
        .context(MissingArchiveMemberSnafu {
            path,
            member: extension,
        })?;
    debug!("read_member: {}: {}", path, name);
    let mut file = zip.by_name(name).context(OpeningArchiveSnafu { path })?;
    let mut res: Vec<u8> = Vec::new();
    file.read_to_end(&mut res)
        .context(OpeningFileSnafu { path: name.clone() })?;
    Ok(res)
}

/// Reads a response archive and decodes its column names.
pub fn read_archive(path: &str, issues: &mut Vec<Issue>) -> ConvertResult<InputTable> {
    let bytes = fs::read(path).context(OpeningFileSnafu { path })?;
    let mut zip =
        ZipArchive::new(Cursor::new(bytes.as_slice())).context(OpeningArchiveSnafu { path })?;
    let mut names: Vec<String> = zip.file_names().map(|s| s.to_string()).collect();
    names.sort();

    let structure_bytes = read_member(&mut zip, &names, ".lss", path)?;
    let responses_bytes = read_member(&mut zip, &names, ".lsr", path)?;

    let decoder = LimeSurveyDecoder {};
    let structure = decoder
        .decode(&structure_bytes)
        .context(DecodingArchiveSnafu { path })?;
    info!(
        "read_archive: {}: {} survey {:?}, {} fields",
        path,
        decoder.format_name(),
        structure.metadata.title,
        structure.fields.len()
    );
    let (headers, rows) = read_responses(&responses_bytes).context(ParsingXmlSnafu { path })?;

    let mut table = InputTable::new(
        &simplify_file_name(path),
        &input_digest(&bytes),
        &headers,
        rows,
    );
    table.headers = decode_headers(&headers, &structure, issues);
    table.strict_levels = structure.metadata.strict_levels;
    Ok(table)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    pub(crate) const STRUCTURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<document>
 <LimeSurveyDocType>Survey</LimeSurveyDocType>
 <DBVersion>366</DBVersion>
 <languages>
  <language>en</language>
 </languages>
 <answers>
  <fields><fieldname>qid</fieldname><fieldname>code</fieldname><fieldname>language</fieldname></fields>
  <rows>
   <row><qid><![CDATA[10]]></qid><code><![CDATA[0]]></code><language><![CDATA[en]]></language></row>
   <row><qid><![CDATA[10]]></qid><code><![CDATA[1]]></code><language><![CDATA[en]]></language></row>
   <row><qid><![CDATA[10]]></qid><code><![CDATA[2]]></code><language><![CDATA[en]]></language></row>
  </rows>
 </answers>
 <questions>
  <fields><fieldname>qid</fieldname><fieldname>parent_qid</fieldname><fieldname>sid</fieldname><fieldname>gid</fieldname><fieldname>type</fieldname><fieldname>title</fieldname><fieldname>question</fieldname><fieldname>mandatory</fieldname><fieldname>language</fieldname></fields>
  <rows>
   <row><qid>10</qid><parent_qid>0</parent_qid><sid>123456</sid><gid>7</gid><type>F</type><title>WB</title><question>Over the last two weeks &amp; more</question><mandatory>Y</mandatory><language>en</language></row>
   <row><qid>11</qid><parent_qid>0</parent_qid><sid>123456</sid><gid>7</gid><type>Y</type><title>consent</title><question>Do you agree?</question><mandatory>N</mandatory><language>en</language></row>
  </rows>
 </questions>
 <subquestions>
  <fields><fieldname>qid</fieldname><fieldname>parent_qid</fieldname><fieldname>title</fieldname><fieldname>language</fieldname></fields>
  <rows>
   <row><qid>20</qid><parent_qid>10</parent_qid><title>WB01</title><language>en</language></row>
   <row><qid>21</qid><parent_qid>10</parent_qid><title>WB02</title><language>en</language></row>
  </rows>
 </subquestions>
 <surveys_languagesettings>
  <rows><row><surveyls_language>en</surveyls_language><surveyls_title>Wellbeing &amp; mood</surveyls_title></row></rows>
 </surveys_languagesettings>
</document>
"#;

    pub(crate) const RESPONSES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<document>
 <LimeSurveyDocType>Responses</LimeSurveyDocType>
 <responses>
  <fields><fieldname>id</fieldname><fieldname>123456X7X10WB01</fieldname><fieldname>123456X7X10WB02</fieldname><fieldname>123456X7X11</fieldname></fields>
  <rows>
   <row><id><![CDATA[P1]]></id><_123456X7X10WB01><![CDATA[1]]></_123456X7X10WB01><_123456X7X10WB02><![CDATA[2]]></_123456X7X10WB02><_123456X7X11>Y</_123456X7X11></row>
   <row><id>P2</id><_123456X7X10WB01/><_123456X7X11>N</_123456X7X11></row>
  </rows>
 </responses>
</document>
"#;

    #[test]
    fn decodes_structure() {
        let s = LimeSurveyDecoder {}.decode(STRUCTURE.as_bytes()).unwrap();
        assert_eq!(s.metadata.title.as_deref(), Some("Wellbeing & mood"));
        assert_eq!(s.metadata.language.as_deref(), Some("en"));
        assert!(s.metadata.strict_levels);
        let codes: Vec<(&str, &str)> = s
            .fields
            .iter()
            .map(|f| (f.code.as_str(), f.candidate_name.as_str()))
            .collect();
        assert_eq!(
            codes,
            vec![
                ("123456X7X10WB01", "WB01"),
                ("123456X7X10WB02", "WB02"),
                ("123456X7X11", "consent"),
            ]
        );
        assert_eq!(s.fields[0].alternates, vec!["WBWB01".to_string()]);
        assert_eq!(s.fields[0].hints.answer_codes, vec!["0", "1", "2"]);
        assert_eq!(
            s.fields[0].hints.text.as_deref(),
            Some("Over the last two weeks & more")
        );
        assert!(s.fields[0].hints.mandatory);
        assert_eq!(s.fields[2].hints.answer_codes, vec!["Y", "N"]);
    }

    #[test]
    fn rejects_other_documents() {
        let res = LimeSurveyDecoder {}.decode(RESPONSES.as_bytes());
        assert!(matches!(res, Err(DecodeError::Unrecognized(_))));
        let res = LimeSurveyDecoder {}.decode(b"<document><questions></document>");
        assert!(matches!(res, Err(DecodeError::Unreadable(_))));
    }

    #[test]
    fn reads_responses() {
        let (headers, rows) = read_responses(RESPONSES.as_bytes()).unwrap();
        assert_eq!(headers[1], "123456X7X10WB01");
        assert_eq!(rows[0], vec!["P1", "1", "2", "Y"]);
        assert_eq!(rows[1], vec!["P2", "", "", "N"]);
    }

    pub(crate) fn write_archive(path: &std::path::Path) {
        let file = fs::File::create(path).unwrap();
        let mut zw = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        zw.start_file("survey_archive_123456.lss", options).unwrap();
        zw.write_all(STRUCTURE.as_bytes()).unwrap();
        zw.start_file("survey_archive_123456_responses.lsr", options)
            .unwrap();
        zw.write_all(RESPONSES.as_bytes()).unwrap();
        zw.finish().unwrap();
    }

    #[test]
    fn reads_archives() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("survey_123456.lsa");
        write_archive(&p);
        let mut issues = Vec::new();
        let t = read_archive(&p.display().to_string(), &mut issues).unwrap();
        assert_eq!(t.source, "survey_123456.lsa");
        assert!(t.strict_levels);
        assert_eq!(t.headers[0], ColumnHeader::plain("id"));
        assert_eq!(t.headers[1].raw, "123456X7X10WB01");
        assert_eq!(
            t.headers[1].decoded,
            vec!["WB01".to_string(), "WBWB01".to_string()]
        );
        assert_eq!(t.rows.len(), 2);
        assert_eq!(issues[0].code, IssueCode::ArchiveFieldDecoded);
    }
}
