//! Instrument templates: the schema types and their validation at load time.

use std::collections::{BTreeMap, HashSet};
use std::error::Error;
use std::fmt::Display;

use log::debug;
use serde_json::Map as JSMap;
use serde_json::Value as JSValue;

use crate::config::{Issue, IssueCode, ItemRef};
use crate::sessions::session_label;

/// The language assumed when a template does not declare any.
pub const DEFAULT_LANGUAGE: &str = "en";

// Top-level keys of a template document that never describe an item.
const RESERVED_KEYS: [&str; 7] = [
    "Study",
    "Technical",
    "I18n",
    "Scoring",
    "Normative",
    "Metadata",
    "Questions",
];

/// Bibliographic and descriptive metadata of an instrument.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct StudyMetadata {
    pub name: Option<String>,
    pub short_name: Option<String>,
    pub authors: Vec<String>,
    pub year: Option<String>,
    pub doi: Option<String>,
    pub license: Option<String>,
    /// Per-language free text (instructions, description).
    pub text: BTreeMap<String, String>,
    /// The `Study` block as found in the document, copied to sidecars.
    pub raw: JSValue,
}

/// One canonical question or measure of an instrument.
#[derive(PartialEq, Debug, Clone)]
pub struct Item {
    pub item_id: String,
    /// Language code -> text. Never empty.
    pub description: BTreeMap<String, String>,
    /// Raw value -> label, in declaration order.
    pub levels: Option<Vec<(String, String)>>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub reversed: bool,
    pub alias_of: Option<String>,
    pub aliases: Vec<String>,
    /// Normalized session label (`ses-<label>`).
    pub session_hint: Option<String>,
    pub run_hint: Option<u32>,
    /// All the description texts are acceptable column names for this item.
    pub description_alias: bool,
}

impl Item {
    pub fn new(item_id: &str, description: &str) -> Item {
        let mut d = BTreeMap::new();
        d.insert(DEFAULT_LANGUAGE.to_string(), description.to_string());
        Item {
            item_id: item_id.to_string(),
            description: d,
            levels: None,
            min: None,
            max: None,
            reversed: false,
            alias_of: None,
            aliases: Vec::new(),
            session_hint: None,
            run_hint: None,
            description_alias: false,
        }
    }

    /// A description of why the declared levels and numeric bounds cannot both
    /// hold, if that is the case.
    pub fn bounds_conflict(&self) -> Option<String> {
        if let (Some(lo), Some(hi)) = (self.min, self.max) {
            if lo > hi {
                return Some(format!("minimum {} is greater than maximum {}", lo, hi));
            }
        }
        let levels = self.levels.as_ref()?;
        if self.min.is_none() && self.max.is_none() {
            return None;
        }
        for (k, _) in levels.iter() {
            match k.trim().parse::<f64>() {
                Err(_) => {
                    return Some(format!(
                        "level {:?} is not numeric but numeric bounds are declared",
                        k
                    ))
                }
                Ok(x) if self.min.map(|lo| x < lo).unwrap_or(false) => {
                    return Some(format!("level {:?} is below the minimum", k))
                }
                Ok(x) if self.max.map(|hi| x > hi).unwrap_or(false) => {
                    return Some(format!("level {:?} is above the maximum", k))
                }
                Ok(_) => {}
            }
        }
        None
    }

    /// The definition of the item as written to sidecars.
    pub fn to_json(&self) -> JSValue {
        let mut o = JSMap::new();
        o.insert(
            "Description".to_string(),
            JSValue::Object(
                self.description
                    .iter()
                    .map(|(lang, text)| (lang.clone(), JSValue::String(text.clone())))
                    .collect(),
            ),
        );
        if let Some(levels) = self.levels.as_ref() {
            o.insert(
                "Levels".to_string(),
                JSValue::Object(
                    levels
                        .iter()
                        .map(|(k, label)| (k.clone(), JSValue::String(label.clone())))
                        .collect(),
                ),
            );
        }
        if let Some(x) = self.min {
            o.insert("MinValue".to_string(), JSValue::from(x));
        }
        if let Some(x) = self.max {
            o.insert("MaxValue".to_string(), JSValue::from(x));
        }
        if self.reversed {
            o.insert("Reversed".to_string(), JSValue::Bool(true));
        }
        JSValue::Object(o)
    }
}

/// One instrument definition. Immutable once loaded.
#[derive(PartialEq, Debug, Clone)]
pub struct Template {
    /// The short name of the instrument, also used as task name.
    pub key: String,
    /// Where the template was read from.
    pub source: String,
    pub study: StudyMetadata,
    /// Declared languages, the default one first.
    pub languages: Vec<String>,
    /// The items in declaration order.
    pub items: Vec<Item>,
}

impl Template {
    pub fn item(&self, item_id: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.item_id == item_id)
    }

    pub fn item_ref(&self, item_id: &str) -> ItemRef {
        ItemRef::new(&self.key, item_id)
    }

    /// The metadata sidecar of a data file holding the given items: the
    /// `Study` block followed by the item definitions, in the given order.
    pub fn sidecar(&self, item_ids: &[String]) -> JSValue {
        let mut study = match &self.study.raw {
            JSValue::Object(o) => o.clone(),
            _ => JSMap::new(),
        };
        study
            .entry("ShortName")
            .or_insert_with(|| JSValue::String(self.key.clone()));
        let mut doc = JSMap::new();
        doc.insert("Study".to_string(), JSValue::Object(study));
        for id in item_ids.iter() {
            if let Some(item) = self.item(id) {
                doc.insert(id.clone(), item.to_json());
            }
        }
        JSValue::Object(doc)
    }

    pub fn default_language(&self) -> &str {
        self.languages
            .first()
            .map(|s| s.as_str())
            .unwrap_or(DEFAULT_LANGUAGE)
    }

    /// Parses a template document.
    ///
    /// `key_hint` is used as template key when the document does not name the
    /// instrument itself. Non-fatal observations (missing translations) are
    /// returned next to the template.
    pub fn from_json(
        key_hint: &str,
        source: &str,
        contents: &str,
    ) -> Result<(Template, Vec<Issue>), TemplateError> {
        let js: JSValue = serde_json::from_str(contents)
            .map_err(|e| TemplateError::Json(source.to_string(), e.to_string()))?;
        let root = js
            .as_object()
            .ok_or_else(|| TemplateError::NotAnObject(source.to_string()))?;

        let study_js = root
            .get("Study")
            .filter(|v| v.is_object())
            .ok_or_else(|| TemplateError::MissingStudy(source.to_string()))?;
        let study = read_study(study_js);

        let key = study
            .short_name
            .clone()
            .or_else(|| read_string(study_js.get("TaskName")))
            .unwrap_or_else(|| key_hint.to_string())
            .trim()
            .to_lowercase();
        if key.is_empty() {
            return Err(TemplateError::MissingStudy(source.to_string()));
        }

        let languages = read_languages(root);
        let default_language = languages
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        let item_objs: Vec<(&String, &JSValue)> = match root.get("Questions") {
            Some(JSValue::Object(qs)) => qs.iter().collect(),
            Some(_) => {
                return Err(TemplateError::InvalidItem {
                    source: source.to_string(),
                    item_id: "Questions".to_string(),
                    reason: "Questions must be an object".to_string(),
                })
            }
            None => root
                .iter()
                .filter(|(k, v)| {
                    !RESERVED_KEYS.contains(&k.as_str())
                        && v.as_object()
                            .map(|o| o.contains_key("Description"))
                            .unwrap_or(false)
                })
                .collect(),
        };

        let mut items: Vec<Item> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut issues: Vec<Issue> = Vec::new();
        for (item_id, v) in item_objs {
            if !seen.insert(item_id.clone()) {
                return Err(TemplateError::DuplicateItem(
                    source.to_string(),
                    item_id.clone(),
                ));
            }
            let item = read_item(source, item_id, v, &default_language)?;
            for lang in languages.iter() {
                if !item.description.contains_key(lang) {
                    issues.push(
                        Issue::warning(
                            IssueCode::MissingTranslation,
                            format!(
                                "item {} of template {} has no description in language {:?}",
                                item_id, key, lang
                            ),
                        )
                        .item(&ItemRef::new(&key, item_id)),
                    );
                }
            }
            items.push(item);
        }
        if items.is_empty() {
            return Err(TemplateError::NoItems(source.to_string()));
        }
        debug!(
            "Template::from_json: {} ({}): {} items, languages {:?}",
            key,
            source,
            items.len(),
            languages
        );

        Ok((
            Template {
                key,
                source: source.to_string(),
                study,
                languages,
                items,
            },
            issues,
        ))
    }
}

/// The reasons a template document is rejected.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum TemplateError {
    Json(String, String),
    NotAnObject(String),
    MissingStudy(String),
    NoItems(String),
    DuplicateItem(String, String),
    InvalidItem {
        source: String,
        item_id: String,
        reason: String,
    },
}

impl Error for TemplateError {}

impl Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::Json(src, msg) => write!(f, "{}: malformed JSON: {}", src, msg),
            TemplateError::NotAnObject(src) => write!(f, "{}: the document is not an object", src),
            TemplateError::MissingStudy(src) => {
                write!(f, "{}: missing or unnamed Study block", src)
            }
            TemplateError::NoItems(src) => write!(f, "{}: the template declares no item", src),
            TemplateError::DuplicateItem(src, id) => {
                write!(f, "{}: item {} is declared twice", src, id)
            }
            TemplateError::InvalidItem {
                source,
                item_id,
                reason,
            } => write!(f, "{}: item {}: {}", source, item_id, reason),
        }
    }
}

fn read_study(js: &JSValue) -> StudyMetadata {
    let authors = match js.get("Authors") {
        Some(JSValue::Array(l)) => l.iter().filter_map(|a| read_string(Some(a))).collect(),
        Some(JSValue::String(s)) => vec![s.clone()],
        _ => vec![],
    };
    let text = match js.get("Description").or_else(|| js.get("Instructions")) {
        Some(JSValue::Object(o)) => o
            .iter()
            .filter_map(|(lang, v)| read_string(Some(v)).map(|s| (lang.clone(), s)))
            .collect(),
        Some(JSValue::String(s)) => [(DEFAULT_LANGUAGE.to_string(), s.clone())]
            .into_iter()
            .collect(),
        _ => BTreeMap::new(),
    };
    StudyMetadata {
        name: read_string(js.get("OriginalName")).or_else(|| read_string(js.get("Name"))),
        short_name: read_string(js.get("ShortName")),
        authors,
        year: read_string(js.get("Year")),
        doi: read_string(js.get("DOI")),
        license: read_string(js.get("License")),
        text,
        raw: js.clone(),
    }
}

fn read_languages(root: &JSMap<String, JSValue>) -> Vec<String> {
    let declared = root
        .get("Study")
        .and_then(|s| s.get("Languages"))
        .or_else(|| root.get("I18n").and_then(|s| s.get("Languages")));
    match declared {
        Some(JSValue::Array(l)) => l
            .iter()
            .filter_map(|v| read_string(Some(v)))
            .map(|s| s.to_lowercase())
            .collect(),
        _ => vec![],
    }
}

fn read_item(
    source: &str,
    item_id: &str,
    js: &JSValue,
    default_language: &str,
) -> Result<Item, TemplateError> {
    let invalid = |reason: &str| TemplateError::InvalidItem {
        source: source.to_string(),
        item_id: item_id.to_string(),
        reason: reason.to_string(),
    };
    let obj = js.as_object().ok_or_else(|| invalid("not an object"))?;

    let description: BTreeMap<String, String> = match obj.get("Description") {
        Some(JSValue::Object(o)) => o
            .iter()
            .filter_map(|(lang, v)| read_string(Some(v)).map(|s| (lang.to_lowercase(), s)))
            .collect(),
        Some(JSValue::String(s)) if !s.trim().is_empty() => {
            [(default_language.to_string(), s.clone())].into_iter().collect()
        }
        _ => BTreeMap::new(),
    };
    if description.is_empty() {
        return Err(invalid("a description in at least one language is required"));
    }

    let levels = match obj.get("Levels") {
        None | Some(JSValue::Null) => None,
        Some(JSValue::Object(o)) if !o.is_empty() => Some(
            o.iter()
                .map(|(k, v)| (k.clone(), read_label(v, default_language)))
                .collect::<Vec<(String, String)>>(),
        ),
        Some(_) => return Err(invalid("Levels must be a non-empty object")),
    };

    let min = read_bound(obj.get("MinValue").or_else(|| obj.get("Min")))
        .map_err(|_| invalid("the minimum is not a number"))?;
    let max = read_bound(obj.get("MaxValue").or_else(|| obj.get("Max")))
        .map_err(|_| invalid("the maximum is not a number"))?;

    let reversed = match obj.get("Reversed") {
        None | Some(JSValue::Null) => false,
        Some(JSValue::Bool(b)) => *b,
        Some(JSValue::String(s)) => s.eq_ignore_ascii_case("true"),
        Some(_) => return Err(invalid("Reversed must be a boolean")),
    };

    let alias_of = read_string(obj.get("AliasOf"));

    let aliases: Vec<String> = match obj.get("Aliases") {
        None | Some(JSValue::Null) => vec![],
        Some(JSValue::Array(l)) => l.iter().filter_map(|v| read_string(Some(v))).collect(),
        Some(JSValue::String(s)) => vec![s.clone()],
        Some(_) => return Err(invalid("Aliases must be a list of strings")),
    };

    let session_hint = match read_string(obj.get("SessionHint")) {
        Some(s) => Some(session_label(&s).ok_or_else(|| invalid("empty SessionHint"))?),
        None => None,
    };

    let run_hint = match obj.get("RunHint") {
        None | Some(JSValue::Null) => None,
        Some(v) => {
            let parsed = match v {
                JSValue::Number(n) => n.as_u64().and_then(|x| u32::try_from(x).ok()),
                JSValue::String(s) => s.trim().trim_start_matches("run-").parse::<u32>().ok(),
                _ => None,
            };
            match parsed {
                Some(r) if r > 0 => Some(r),
                _ => {
                    return Err(invalid(&format!(
                        "RunHint must be a positive run index, found {}",
                        v
                    )))
                }
            }
        }
    };

    let description_alias = matches!(obj.get("DescriptionAlias"), Some(JSValue::Bool(true)));

    Ok(Item {
        item_id: item_id.to_string(),
        description,
        levels,
        min,
        max,
        reversed,
        alias_of,
        aliases,
        session_hint,
        run_hint,
        description_alias,
    })
}

fn read_string(v: Option<&JSValue>) -> Option<String> {
    match v {
        Some(JSValue::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(JSValue::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn read_label(v: &JSValue, default_language: &str) -> String {
    match v {
        JSValue::String(s) => s.clone(),
        JSValue::Object(o) => o
            .get(default_language)
            .or_else(|| o.values().next())
            .and_then(|l| read_string(Some(l)))
            .unwrap_or_default(),
        JSValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn read_bound(v: Option<&JSValue>) -> Result<Option<f64>, ()> {
    match v {
        None | Some(JSValue::Null) => Ok(None),
        Some(JSValue::Number(n)) => n.as_f64().map(Some).ok_or(()),
        Some(JSValue::String(s)) => s.trim().parse::<f64>().map(Some).map_err(|_| ()),
        Some(_) => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELLBEING: &str = r#"{
        "Study": {"OriginalName": "Well-being index", "ShortName": "wellbeing",
                  "Languages": ["en", "de"], "Authors": ["A. Author"], "Year": 1998},
        "WB01": {"Description": {"en": "I felt cheerful", "de": "Ich war froh"},
                 "Levels": {"0": "never", "1": {"en": "sometimes", "de": "manchmal"}}},
        "WB02": {"Description": {"en": "I felt calm"}, "Reversed": true,
                 "Aliases": ["wb_2"], "SessionHint": "2"}
    }"#;

    #[test]
    fn reads_flat_template() {
        let (t, issues) = Template::from_json("x", "wellbeing.json", WELLBEING).unwrap();
        assert_eq!(t.key, "wellbeing");
        assert_eq!(t.languages, vec!["en".to_string(), "de".to_string()]);
        assert_eq!(t.items.len(), 2);
        let wb01 = t.item("WB01").unwrap();
        assert_eq!(
            wb01.levels,
            Some(vec![
                ("0".to_string(), "never".to_string()),
                ("1".to_string(), "sometimes".to_string())
            ])
        );
        let wb02 = t.item("WB02").unwrap();
        assert!(wb02.reversed);
        assert_eq!(wb02.aliases, vec!["wb_2".to_string()]);
        assert_eq!(wb02.session_hint.as_deref(), Some("ses-2"));
        assert_eq!(t.study.year.as_deref(), Some("1998"));
        // WB02 misses its German text.
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::MissingTranslation);
        assert_eq!(issues[0].context.item_id.as_deref(), Some("WB02"));
    }

    #[test]
    fn sidecar_keeps_study_and_level_order() {
        let (t, _) = Template::from_json("x", "wellbeing.json", WELLBEING).unwrap();
        let doc = t.sidecar(&["WB02".to_string(), "WB01".to_string()]);
        let keys: Vec<&String> = doc.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["Study", "WB02", "WB01"]);
        assert_eq!(doc["Study"]["ShortName"], "wellbeing");
        assert_eq!(doc["WB02"]["Reversed"], JSValue::Bool(true));
        let levels: Vec<&String> = doc["WB01"]["Levels"].as_object().unwrap().keys().collect();
        assert_eq!(levels, vec!["0", "1"]);
    }

    #[test]
    fn reads_nested_questions_and_uses_key_hint() {
        let doc = r#"{"Study": {"OriginalName": "Sleep"},
            "Questions": {"S1": {"Description": {"en": "Hours"}, "MinValue": 0, "MaxValue": "24"}}}"#;
        let (t, issues) = Template::from_json("Sleep", "survey-sleep.json", doc).unwrap();
        assert_eq!(t.key, "sleep");
        assert!(issues.is_empty());
        let s1 = t.item("S1").unwrap();
        assert_eq!(s1.min, Some(0.0));
        assert_eq!(s1.max, Some(24.0));
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(matches!(
            Template::from_json("a", "a.json", "{not json"),
            Err(TemplateError::Json(_, _))
        ));
        assert!(matches!(
            Template::from_json("a", "a.json", r#"{"Q1": {"Description": {"en": "x"}}}"#),
            Err(TemplateError::MissingStudy(_))
        ));
        assert!(matches!(
            Template::from_json("a", "a.json", r#"{"Study": {}, "Q1": {"Text": "x"}}"#),
            Err(TemplateError::NoItems(_))
        ));
        assert!(matches!(
            Template::from_json(
                "a",
                "a.json",
                r#"{"Study": {}, "Questions": {"Q1": {"Description": {}}}}"#
            ),
            Err(TemplateError::InvalidItem { .. })
        ));
    }

    #[test]
    fn run_hints_must_fit() {
        let doc = |hint: &str| {
            format!(
                r#"{{"Study": {{}}, "Q1": {{"Description": "x", "RunHint": {}}}}}"#,
                hint
            )
        };
        let (t, _) = Template::from_json("a", "a.json", &doc("\"run-2\"")).unwrap();
        assert_eq!(t.item("Q1").unwrap().run_hint, Some(2));
        let (t, _) = Template::from_json("a", "a.json", &doc("null")).unwrap();
        assert_eq!(t.item("Q1").unwrap().run_hint, None);
        for bad in ["4294967297", "0", "-1", "\"two\""] {
            match Template::from_json("a", "a.json", &doc(bad)) {
                Err(TemplateError::InvalidItem { reason, .. }) => {
                    assert!(reason.contains(bad.trim_matches('"')), "{}", reason)
                }
                other => panic!("{}: {:?}", bad, other.map(|(t, _)| t.key)),
            }
        }
    }

    #[test]
    fn detects_bounds_conflicts() {
        let mut item = Item::new("Q1", "question");
        item.levels = Some(vec![
            ("1".to_string(), "low".to_string()),
            ("5".to_string(), "high".to_string()),
        ]);
        assert_eq!(item.bounds_conflict(), None);
        item.min = Some(1.0);
        item.max = Some(5.0);
        assert_eq!(item.bounds_conflict(), None);
        item.max = Some(4.0);
        assert!(item.bounds_conflict().is_some());
        item.levels = Some(vec![("a".to_string(), "A".to_string())]);
        item.max = Some(5.0);
        assert!(item.bounds_conflict().is_some());
        item.levels = None;
        item.min = Some(6.0);
        assert!(item.bounds_conflict().is_some());
    }
}
