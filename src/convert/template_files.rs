// Reading the template library roots.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::convert::*;

// The template key when the document does not name the instrument.
fn key_hint(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    stem.strip_prefix("survey-").unwrap_or(stem).to_string()
}

fn is_json_file(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_file()
        && entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
}

/// Reads all the templates under the given roots, in priority order.
///
/// Files that are not valid templates are reported and skipped. Within a root,
/// files are read in path order.
pub fn load_templates(roots: &[PathBuf]) -> ConvertResult<(Vec<Template>, Vec<Issue>)> {
    let mut templates: Vec<Template> = Vec::new();
    let mut issues: Vec<Issue> = Vec::new();
    for root in roots.iter() {
        let root_s = root.display().to_string();
        ensure!(root.is_dir(), MissingLibrarySnafu { path: root_s });
        let mut count = 0;
        for entry_r in WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
        {
            let entry = entry_r.context(ScanningLibrarySnafu {
                path: root_s.clone(),
            })?;
            if !is_json_file(&entry) {
                continue;
            }
            let path = entry.path();
            let source = path
                .strip_prefix(root)
                .unwrap_or(path)
                .display()
                .to_string();
            let contents = fs::read_to_string(path).context(OpeningFileSnafu {
                path: path.display().to_string(),
            })?;
            match Template::from_json(&key_hint(path), &source, &contents) {
                Ok((t, template_issues)) => {
                    debug!("load_templates: {}: {} from {}", root_s, t.key, source);
                    issues.extend(template_issues);
                    templates.push(t);
                    count += 1;
                }
                Err(e) => {
                    warn!("load_templates: skipping {}: {}", source, e);
                    issues.push(
                        Issue::error(IssueCode::TemplateInvalid, e.to_string()).file(&source),
                    );
                }
            }
        }
        info!("Loaded {} templates from {}", count, root_s);
    }
    Ok((templates, issues))
}
