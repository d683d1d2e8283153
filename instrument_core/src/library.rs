//! The template library: the set of templates taking part in a run, with every
//! known spelling of every item indexed and alias chains resolved once.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, info};

use crate::config::{Issue, IssueCode, ItemRef};
use crate::template::{Item, Template};

/// Alias chains longer than this are rejected like cycles.
pub const MAX_ALIAS_HOPS: usize = 32;

/// How a name was found in the library. The order of the variants is the
/// matching precedence.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub enum MatchTier {
    /// The name is an item id of the library.
    Exact,
    /// The name is a declared alias (or an alias-eligible description).
    Alias,
    /// The name matches an id or an alias after case folding and whitespace
    /// collapsing.
    Normalized,
}

/// The result of looking up a name.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct LookupHit {
    pub tier: MatchTier,
    /// The canonical items the name resolves to, sorted. More than one
    /// element means the name is ambiguous.
    pub candidates: Vec<ItemRef>,
    /// The name designates an item only through an alias (`Aliases` or
    /// `AliasOf`).
    pub via_alias: bool,
}

#[derive(Debug, Clone)]
pub struct TemplateLibrary {
    templates: Vec<Template>,
    // Every item -> its canonical item (itself when not aliased).
    canonical: HashMap<ItemRef, ItemRef>,
    exact_ids: HashMap<String, Vec<ItemRef>>,
    aliases: HashMap<String, Vec<ItemRef>>,
    normalized: HashMap<String, Vec<ItemRef>>,
}

/// Case-folds and collapses the whitespace of a name.
pub fn normalize_name(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
        .to_lowercase()
}

impl TemplateLibrary {
    /// Builds the library for one run.
    ///
    /// `templates` are given in priority order: a template whose key was
    /// already seen is shadowed. When `instruments` is provided, only these
    /// templates are kept.
    ///
    /// Returns the library and the non-fatal issues, or every fatal issue found.
    pub fn build(
        templates: Vec<Template>,
        instruments: Option<&[String]>,
    ) -> Result<(TemplateLibrary, Vec<Issue>), Vec<Issue>> {
        let mut issues: Vec<Issue> = Vec::new();
        let mut fatal: Vec<Issue> = Vec::new();

        let mut unique: Vec<Template> = Vec::new();
        for t in templates.into_iter() {
            let shadowed_by = unique
                .iter()
                .find(|u| u.key == t.key)
                .map(|u| u.source.clone());
            if let Some(first_source) = shadowed_by {
                issues.push(
                    Issue::info(
                        IssueCode::TemplateShadowed,
                        format!(
                            "template {} from {} is shadowed by {}",
                            t.key, t.source, first_source
                        ),
                    )
                    .template(&t.key)
                    .file(&t.source),
                );
            } else {
                unique.push(t);
            }
        }

        let selected: Vec<Template> = match instruments {
            Some(keys) => {
                let mut sel: Vec<Template> = Vec::new();
                for k in keys.iter() {
                    let k = k.trim().to_lowercase();
                    if sel.iter().any(|t| t.key == k) {
                        continue;
                    }
                    match unique.iter().find(|t| t.key == k) {
                        Some(t) => sel.push(t.clone()),
                        None => fatal.push(
                            Issue::error(
                                IssueCode::InstrumentNotFound,
                                format!("instrument {} is not in the template library", k),
                            )
                            .template(&k),
                        ),
                    }
                }
                if sel.len() > 1 {
                    fatal.extend(duplicate_item_ids(&sel));
                }
                sel
            }
            None => unique,
        };

        let mut canonical: HashMap<ItemRef, ItemRef> = HashMap::new();
        for t in selected.iter() {
            for item in t.items.iter() {
                match resolve_alias_chain(t, item) {
                    Ok(target) => {
                        if target != item.item_id {
                            debug!(
                                "TemplateLibrary::build: {}: {} resolves to {}",
                                t.key, item.item_id, target
                            );
                        }
                        canonical.insert(t.item_ref(&item.item_id), t.item_ref(&target));
                    }
                    Err(issue) => fatal.push(issue),
                }
            }
        }

        if !fatal.is_empty() {
            return Err(fatal);
        }

        let mut lib = TemplateLibrary {
            templates: selected,
            canonical,
            exact_ids: HashMap::new(),
            aliases: HashMap::new(),
            normalized: HashMap::new(),
        };
        lib.index();
        info!(
            "Template library: {} templates: {:?}",
            lib.templates.len(),
            lib.templates.iter().map(|t| t.key.clone()).collect::<Vec<String>>()
        );
        Ok((lib, issues))
    }

    fn index(&mut self) {
        for t in self.templates.iter() {
            for item in t.items.iter() {
                let r = t.item_ref(&item.item_id);
                self.exact_ids
                    .entry(item.item_id.clone())
                    .or_default()
                    .push(r.clone());
                self.normalized
                    .entry(normalize_name(&item.item_id))
                    .or_default()
                    .push(r.clone());
                let mut alias_names: Vec<&String> = item.aliases.iter().collect();
                if item.description_alias {
                    alias_names.extend(item.description.values());
                }
                for a in alias_names {
                    self.aliases.entry(a.clone()).or_default().push(r.clone());
                    self.normalized
                        .entry(normalize_name(a))
                        .or_default()
                        .push(r.clone());
                }
            }
        }
    }

    /// Finds the canonical items designated by a name, following the matching
    /// precedence: exact id, then alias, then normalized comparison.
    pub fn lookup(&self, name: &str) -> Option<LookupHit> {
        let tiers = [
            (MatchTier::Exact, self.exact_ids.get(name)),
            (MatchTier::Alias, self.aliases.get(name)),
            (MatchTier::Normalized, self.normalized.get(&normalize_name(name))),
        ];
        for (tier, refs) in tiers.iter() {
            if let Some(refs) = refs {
                if refs.is_empty() {
                    continue;
                }
                let candidates: BTreeSet<ItemRef> =
                    refs.iter().map(|r| self.canonical(r)).collect();
                let via_alias = *tier == MatchTier::Alias
                    || refs.iter().any(|r| self.canonical(r) != *r)
                    || (*tier == MatchTier::Normalized
                        && refs.iter().all(|r| normalize_name(&r.item_id) != normalize_name(name)));
                return Some(LookupHit {
                    tier: *tier,
                    candidates: candidates.into_iter().collect(),
                    via_alias,
                });
            }
        }
        None
    }

    /// The canonical item of an item of the library.
    pub fn canonical(&self, r: &ItemRef) -> ItemRef {
        self.canonical.get(r).cloned().unwrap_or_else(|| r.clone())
    }

    pub fn item(&self, r: &ItemRef) -> Option<&Item> {
        self.template(&r.template).and_then(|t| t.item(&r.item_id))
    }

    pub fn template(&self, key: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.key == key)
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    /// The item ids declared by more than one of the given templates, as
    /// fatal issues. Without an explicit selection, the templates that
    /// matched a column are the ones selected for the run.
    pub fn shared_item_ids(&self, keys: &[String]) -> Vec<Issue> {
        duplicate_item_ids(self.templates.iter().filter(|t| keys.contains(&t.key)))
    }

    /// The position of an item in its template, used to order output columns.
    pub fn item_position(&self, r: &ItemRef) -> usize {
        self.template(&r.template)
            .and_then(|t| t.items.iter().position(|i| i.item_id == r.item_id))
            .unwrap_or(usize::MAX)
    }
}

// Follows the AliasOf references of an item until a non-aliased item.
fn resolve_alias_chain(t: &Template, item: &Item) -> Result<String, Issue> {
    let mut path: Vec<String> = vec![item.item_id.clone()];
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(item.item_id.clone());
    let mut cur: &Item = item;
    while let Some(target_id) = cur.alias_of.as_ref() {
        path.push(target_id.clone());
        if visited.contains(target_id) || path.len() > MAX_ALIAS_HOPS + 1 {
            return Err(Issue::error(
                IssueCode::AliasCycle,
                format!(
                    "template {}: alias cycle {}",
                    t.key,
                    path.join(" -> ")
                ),
            )
            .item(&t.item_ref(&item.item_id))
            .candidates(path.clone()));
        }
        visited.insert(target_id.clone());
        cur = t.item(target_id).ok_or_else(|| {
            Issue::error(
                IssueCode::AliasTargetMissing,
                format!(
                    "template {}: item {} is an alias of {}, which does not exist",
                    t.key,
                    cur.item_id,
                    target_id
                ),
            )
            .item(&t.item_ref(&item.item_id))
            .candidates(path.clone())
        })?;
    }
    Ok(cur.item_id.clone())
}

fn duplicate_item_ids<'a>(templates: impl IntoIterator<Item = &'a Template>) -> Vec<Issue> {
    let mut owners: HashMap<&'a str, Vec<&'a str>> = HashMap::new();
    for t in templates {
        for item in t.items.iter() {
            owners.entry(&item.item_id).or_default().push(&t.key);
        }
    }
    let mut dups: Vec<(&str, Vec<&str>)> = owners
        .into_iter()
        .filter(|(_, ts)| ts.len() > 1)
        .collect();
    dups.sort();
    dups.into_iter()
        .map(|(id, ts)| {
            Issue::error(
                IssueCode::DuplicateItemId,
                format!(
                    "item id {} is declared by several selected templates: {}",
                    id,
                    ts.join(", ")
                ),
            )
            .candidates(ts.iter().map(|s| s.to_string()).collect())
        })
        .collect()
}
