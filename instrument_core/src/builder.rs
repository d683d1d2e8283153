pub use crate::template::{Item, StudyMetadata, Template, DEFAULT_LANGUAGE};

/// A builder for templates that do not come from a JSON document.
///
/// ```
/// use instrument_core::builder::TemplateBuilder;
/// use instrument_core::Item;
///
/// let template = TemplateBuilder::new("wellbeing")
///     .levels_item("WB01", "I felt cheerful", &["0", "1", "2", "3", "4", "5"])
///     .item(Item::new("WB02", "I felt calm"))
///     .alias_item("WB2", "WB02")
///     .build();
///
/// assert_eq!(template.items.len(), 3);
/// ```
pub struct TemplateBuilder {
    key: String,
    source: Option<String>,
    study: StudyMetadata,
    languages: Vec<String>,
    items: Vec<Item>,
}

impl TemplateBuilder {
    pub fn new(key: &str) -> TemplateBuilder {
        TemplateBuilder {
            key: key.trim().to_lowercase(),
            source: None,
            study: StudyMetadata {
                short_name: Some(key.to_string()),
                ..StudyMetadata::default()
            },
            languages: Vec::new(),
            items: Vec::new(),
        }
    }

    /// The location reported for this template (defaults to `<key>.json`).
    pub fn source(mut self, source: &str) -> TemplateBuilder {
        self.source = Some(source.to_string());
        self
    }

    pub fn study(mut self, study: StudyMetadata) -> TemplateBuilder {
        self.study = study;
        self
    }

    pub fn languages(mut self, languages: &[&str]) -> TemplateBuilder {
        self.languages = languages.iter().map(|l| l.to_lowercase()).collect();
        self
    }

    pub fn item(mut self, item: Item) -> TemplateBuilder {
        self.items.push(item);
        self
    }

    /// Adds an item whose answers are restricted to the given codes. The codes
    /// double as labels.
    pub fn levels_item(self, item_id: &str, description: &str, levels: &[&str]) -> TemplateBuilder {
        let mut item = Item::new(item_id, description);
        item.levels = Some(
            levels
                .iter()
                .map(|l| (l.to_string(), l.to_string()))
                .collect(),
        );
        self.item(item)
    }

    /// Adds an item that redirects to another item of the same template.
    pub fn alias_item(self, item_id: &str, alias_of: &str) -> TemplateBuilder {
        let mut item = Item::new(item_id, item_id);
        item.alias_of = Some(alias_of.to_string());
        self.item(item)
    }

    pub fn build(self) -> Template {
        let source = self
            .source
            .unwrap_or_else(|| format!("{}.json", self.key));
        Template {
            key: self.key,
            source,
            study: self.study,
            languages: self.languages,
            items: self.items,
        }
    }
}
