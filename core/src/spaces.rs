use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::config::Config;

/// The tier an item was resolved from. Precedence: project > user > system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Space {
    Project,
    User,
    /// Carries the bundle id of the registered system bundle.
    System(String),
}

impl Space {
    pub fn precedence(&self) -> u8 {
        match self {
            Space::Project => 3,
            Space::User => 2,
            Space::System(_) => 1,
        }
    }

    pub fn is_mutable(&self) -> bool {
        !matches!(self, Space::System(_))
    }

    pub fn label(&self) -> String {
        match self {
            Space::Project => "project".to_string(),
            Space::User => "user".to_string(),
            Space::System(bundle) => format!("system:{bundle}"),
        }
    }

    fn from_label(label: &str) -> Space {
        match label {
            "project" => Space::Project,
            "user" => Space::User,
            other => Space::System(
                other
                    .strip_prefix("system:")
                    .unwrap_or(other)
                    .to_string(),
            ),
        }
    }
}

/// Addressable item kinds. Item ids are relative paths under the type
/// directory, without extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ItemType {
    Tool,
    Directive,
    Knowledge,
}

impl ItemType {
    pub fn type_dir(self) -> &'static str {
        match self {
            ItemType::Tool => "tools",
            ItemType::Directive => "directives",
            ItemType::Knowledge => "knowledge",
        }
    }

    /// Candidate extensions in resolution order. Directives arrive as the
    /// parser's JSON output; tools are sidecar TOML metadata documents.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            ItemType::Tool => &[".tool.toml"],
            ItemType::Directive => &[".json", ".directive.json"],
            ItemType::Knowledge => &[".md"],
        }
    }

    pub fn parse(s: &str) -> Option<ItemType> {
        match s {
            "tool" => Some(ItemType::Tool),
            "directive" => Some(ItemType::Directive),
            "knowledge" => Some(ItemType::Knowledge),
            _ => None,
        }
    }
}

/// A resolved item location.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedItem {
    pub path: PathBuf,
    pub space: Space,
}

/// Find an item file by relative-path id, walking project → user → system.
/// First match wins.
pub fn find_item(config: &Config, item_type: ItemType, item_id: &str) -> Option<ResolvedItem> {
    for (label, ai_dir) in config.search_ai_dirs() {
        let base = ai_dir.join(item_type.type_dir());
        if !base.is_dir() {
            continue;
        }
        for ext in item_type.extensions() {
            let candidate = base.join(format!("{item_id}{ext}"));
            if candidate.is_file() {
                return Some(ResolvedItem {
                    path: candidate,
                    space: Space::from_label(&label),
                });
            }
        }
    }
    None
}

/// One row of a search result: the item id plus where it was found.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub item_type: ItemType,
    pub item_id: String,
    pub space: String,
    pub path: PathBuf,
}

/// Enumerate items of one type whose id matches a substring or glob query.
/// Higher-precedence spaces shadow lower ones for identical ids.
pub fn search_items(config: &Config, item_type: ItemType, query: &str) -> Vec<SearchHit> {
    let matcher = wildmatch::WildMatch::new(&if query.contains('*') {
        query.to_string()
    } else {
        format!("*{query}*")
    });

    let mut seen = std::collections::HashSet::new();
    let mut hits = Vec::new();
    for (label, ai_dir) in config.search_ai_dirs() {
        let base = ai_dir.join(item_type.type_dir());
        if !base.is_dir() {
            continue;
        }
        collect_items(&base, &base, item_type, &mut |item_id, path| {
            if matcher.matches(item_id) && seen.insert(item_id.to_string()) {
                hits.push(SearchHit {
                    item_type,
                    item_id: item_id.to_string(),
                    space: label.clone(),
                    path: path.to_path_buf(),
                });
            }
        });
    }
    hits.sort_by(|a, b| a.item_id.cmp(&b.item_id));
    hits
}

fn collect_items(
    base: &Path,
    dir: &Path,
    item_type: ItemType,
    on_item: &mut impl FnMut(&str, &Path),
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_items(base, &path, item_type, on_item);
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        for ext in item_type.extensions() {
            if let Some(stem) = name.strip_suffix(ext) {
                let rel = path
                    .parent()
                    .and_then(|p| p.strip_prefix(base).ok())
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();
                let item_id = if rel.is_empty() {
                    stem.to_string()
                } else {
                    format!("{rel}/{stem}")
                };
                on_item(&item_id, &path);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn project_shadows_user() {
        let tmp = tempfile::tempdir().unwrap();
        let user = tmp.path().join("home");
        let project = tmp.path().join("proj");
        write(
            &project.join(".ai/knowledge/notes/arch.md"),
            "project copy",
        );
        write(&user.join(".ai/knowledge/notes/arch.md"), "user copy");

        let config = Config::with_spaces(Some(project.clone()), user).unwrap();
        let found = find_item(&config, ItemType::Knowledge, "notes/arch").unwrap();
        assert_eq!(found.space, Space::Project);
        assert!(found.path.starts_with(&project));
    }

    #[test]
    fn search_dedupes_across_spaces() {
        let tmp = tempfile::tempdir().unwrap();
        let user = tmp.path().join("home");
        let project = tmp.path().join("proj");
        write(&project.join(".ai/knowledge/arch.md"), "p");
        write(&user.join(".ai/knowledge/arch.md"), "u");
        write(&user.join(".ai/knowledge/deploy.md"), "u");

        let config = Config::with_spaces(Some(project), user).unwrap();
        let hits = search_items(&config, ItemType::Knowledge, "*");
        assert_eq!(hits.len(), 2);
        let arch = hits.iter().find(|h| h.item_id == "arch").unwrap();
        assert_eq!(arch.space, "project");
    }

    #[test]
    fn space_precedence_ordering() {
        assert!(Space::Project.precedence() > Space::User.precedence());
        assert!(Space::User.precedence() > Space::System("ryeos".into()).precedence());
        assert!(!Space::System("ryeos".into()).is_mutable());
    }
}
