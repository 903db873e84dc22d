//! Capability grammar and matching.
//!
//! Capability strings take the form `rye.<primary>.<item_type>.<dotted_item_id>`
//! where `primary ∈ {execute, search, load, sign}` and
//! `item_type ∈ {tool, directive, knowledge}`; any segment may be `*`.
//! Item ids use `/` separators; capabilities use `.` with fnmatch wildcards.
//!
//! Structural implication: `rye.execute.*` implies `rye.search.*` and
//! `rye.load.*`; `rye.sign.*` implies `rye.load.*`. Implication preserves
//! item-type specificity.

use std::collections::BTreeSet;

use wildmatch::WildMatch;

pub const PRIMARY_TOOLS: [&str; 4] = ["execute", "search", "load", "sign"];
pub const ITEM_TYPES: [&str; 3] = ["tool", "directive", "knowledge"];

/// Tools under this prefix are always allowed: they are the primitives the
/// harness itself needs.
pub const INTERNAL_TOOL_PREFIX: &str = "rye/agent/threads/internal/";

fn implied_primaries(primary: &str) -> &'static [&'static str] {
    match primary {
        "execute" => &["search", "load"],
        "sign" => &["load"],
        _ => &[],
    }
}

/// Parsed form of a capability string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCap {
    pub primary: String,
    pub item_type: String,
    pub specifics: String,
    pub is_wildcard: bool,
}

/// Convert an item id to the capability string required for an action.
pub fn item_id_to_cap(primary: &str, item_type: &str, item_id: &str) -> String {
    let segments = item_id.replace('/', ".");
    format!("rye.{primary}.{item_type}.{segments}")
}

/// The capability string checked for `search`, which carries no item id.
pub fn search_cap(item_type: &str) -> String {
    format!("rye.search.{item_type}")
}

/// Parse a capability string. Returns `None` for anything outside the
/// grammar, which callers treat as never-matching.
pub fn parse_capability(cap: &str) -> Option<ParsedCap> {
    let rest = cap.strip_prefix("rye.")?;
    let mut parts = rest.splitn(3, '.');
    let primary = parts.next()?;

    if primary == "*" {
        return Some(ParsedCap {
            primary: "*".into(),
            item_type: "*".into(),
            specifics: "*".into(),
            is_wildcard: true,
        });
    }
    if !PRIMARY_TOOLS.contains(&primary) {
        return None;
    }

    let Some(item_type) = parts.next() else {
        return Some(ParsedCap {
            primary: primary.into(),
            item_type: "*".into(),
            specifics: "*".into(),
            is_wildcard: true,
        });
    };
    if item_type == "*" {
        return Some(ParsedCap {
            primary: primary.into(),
            item_type: "*".into(),
            specifics: "*".into(),
            is_wildcard: true,
        });
    }
    if !ITEM_TYPES.contains(&item_type) {
        return None;
    }

    let Some(specifics) = parts.next() else {
        return Some(ParsedCap {
            primary: primary.into(),
            item_type: item_type.into(),
            specifics: "*".into(),
            is_wildcard: true,
        });
    };
    Some(ParsedCap {
        primary: primary.into(),
        item_type: item_type.into(),
        is_wildcard: specifics.ends_with('*'),
        specifics: specifics.into(),
    })
}

/// Whether a granted capability satisfies a required one. Exact match,
/// trailing-`.*` prefix match, then fnmatch on the dotted form, then the
/// implicit wildcard of truncated grants like `rye.execute`.
pub fn cap_matches(granted: &str, required: &str) -> bool {
    if granted == required {
        return true;
    }

    if let Some(prefix) = granted.strip_suffix(".*") {
        if required == prefix || required.starts_with(&format!("{prefix}.")) {
            return true;
        }
    }

    if granted.contains('*') && WildMatch::new(granted).matches(required) {
        return true;
    }

    let (Some(g), Some(r)) = (parse_capability(granted), parse_capability(required)) else {
        return false;
    };
    if g.is_wildcard && g.specifics == "*" {
        if g.primary == "*" {
            return true;
        }
        if g.primary == r.primary && (g.item_type == "*" || g.item_type == r.item_type) {
            return true;
        }
    }
    false
}

/// Expand a capability set through structural implication to a fixpoint.
pub fn expand_capabilities<I, S>(caps: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut expanded: BTreeSet<String> =
        caps.into_iter().map(|c| c.as_ref().to_string()).collect();

    let mut changed = true;
    while changed {
        changed = false;
        for cap in expanded.clone() {
            let Some(parsed) = parse_capability(&cap) else {
                continue;
            };
            if parsed.primary == "*" {
                for p in PRIMARY_TOOLS {
                    if expanded.insert(format!("rye.{p}.*")) {
                        changed = true;
                    }
                }
                continue;
            }
            for implied in implied_primaries(&parsed.primary) {
                let new_cap = if parsed.item_type == "*" {
                    format!("rye.{implied}.*")
                } else if parsed.specifics == "*" {
                    format!("rye.{implied}.{}.*", parsed.item_type)
                } else {
                    format!("rye.{implied}.{}.{}", parsed.item_type, parsed.specifics)
                };
                if expanded.insert(new_cap) {
                    changed = true;
                }
            }
        }
    }
    expanded
}

/// Whether a granted set (after expansion) satisfies a required capability.
pub fn check_capability<S: AsRef<str>>(granted: &[S], required: &str) -> bool {
    expand_capabilities(granted.iter().map(|s| s.as_ref()))
        .iter()
        .any(|g| cap_matches(g, required))
}

/// All required capabilities satisfied, or the missing ones.
pub fn check_all_capabilities<S: AsRef<str>>(
    granted: &[S],
    required: &[String],
) -> (bool, Vec<String>) {
    let expanded = expand_capabilities(granted.iter().map(|s| s.as_ref()));
    let missing: Vec<String> = required
        .iter()
        .filter(|req| !expanded.iter().any(|g| cap_matches(g, req)))
        .cloned()
        .collect();
    (missing.is_empty(), missing)
}

/// Attenuate a child's declared capabilities against its parent's.
///
/// For each child cap: keep it when some parent cap covers it; when the
/// child is wider than a parent cap, narrow to the parent's scope; otherwise
/// drop it. The result never widens access beyond the parent.
pub fn attenuate(child_caps: &[String], parent_caps: &[String]) -> Vec<String> {
    if child_caps.is_empty() {
        return parent_caps.to_vec();
    }
    if parent_caps.is_empty() {
        return child_caps.to_vec();
    }
    let mut attenuated = Vec::new();
    for child in child_caps {
        for parent in parent_caps {
            if cap_matches(parent, child) {
                attenuated.push(child.clone());
                break;
            } else if cap_matches(child, parent) {
                attenuated.push(parent.clone());
                break;
            }
        }
    }
    attenuated
}

/// Normalize `/` separators in declared capabilities to the dotted form.
pub fn normalize_cap(cap: &str) -> String {
    cap.replace('/', ".")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exact_and_prefix_matches() {
        assert!(cap_matches(
            "rye.execute.tool.rye.file-system.fs_write",
            "rye.execute.tool.rye.file-system.fs_write"
        ));
        assert!(cap_matches(
            "rye.execute.tool.rye.file-system.*",
            "rye.execute.tool.rye.file-system.fs_write"
        ));
        assert!(cap_matches("rye.execute.*", "rye.execute.tool.anything.at.all"));
        assert!(cap_matches("rye.*", "rye.sign.knowledge.notes"));
        assert!(!cap_matches(
            "rye.execute.tool.rye.file-system.fs_write",
            "rye.execute.tool.rye.file-system.fs_read"
        ));
    }

    #[test]
    fn truncated_grant_is_implicit_wildcard() {
        assert!(cap_matches("rye.execute", "rye.execute.tool.x"));
        assert!(cap_matches("rye.execute.tool", "rye.execute.tool.x.y"));
        assert!(!cap_matches("rye.execute.tool", "rye.execute.directive.x"));
    }

    #[test]
    fn structural_implication_is_transitive() {
        let caps = vec!["rye.execute.*".to_string()];
        assert!(check_capability(&caps, "rye.search.tool.anything"));
        assert!(check_capability(&caps, "rye.load.knowledge.x.y"));
        assert!(!check_capability(&caps, "rye.sign.tool.anything"));
    }

    #[test]
    fn implication_preserves_item_type() {
        let caps = vec!["rye.execute.tool.*".to_string()];
        assert!(check_capability(&caps, "rye.load.tool.any"));
        assert!(!check_capability(&caps, "rye.load.knowledge.any"));
    }

    #[test]
    fn sign_implies_load_only() {
        let caps = vec!["rye.sign.knowledge.notes".to_string()];
        assert!(check_capability(&caps, "rye.load.knowledge.notes"));
        assert!(!check_capability(&caps, "rye.execute.knowledge.notes"));
    }

    #[test]
    fn invalid_grammar_is_rejected() {
        assert!(parse_capability("fs.read").is_none());
        assert!(parse_capability("rye.destroy.tool.x").is_none());
        assert!(parse_capability("rye.execute.widget.x").is_none());
        assert!(parse_capability("rye.*").is_some());
    }

    #[test]
    fn attenuation_narrows_and_drops() {
        // Scenario S4 from the system contract.
        let parent = vec!["rye.execute.tool.rye.file-system.*".to_string()];
        let child = vec![
            "rye.execute.tool.rye.file-system.fs_write".to_string(),
            "rye.execute.tool.network.http_get".to_string(),
        ];
        let result = attenuate(&child, &parent);
        assert_eq!(result, vec!["rye.execute.tool.rye.file-system.fs_write".to_string()]);
    }

    #[test]
    fn attenuation_narrows_wider_child_to_parent() {
        let parent = vec!["rye.execute.tool.rye.file-system.fs_write".to_string()];
        let child = vec!["rye.execute.tool.rye.file-system.*".to_string()];
        let result = attenuate(&child, &parent);
        assert_eq!(result, parent);
    }

    #[test]
    fn attenuation_is_associative() {
        let root = vec!["rye.execute.tool.rye.*".to_string()];
        let mid = vec![
            "rye.execute.tool.rye.file-system.*".to_string(),
            "rye.execute.tool.other.x".to_string(),
        ];
        let leaf = vec!["rye.execute.tool.rye.file-system.fs_write".to_string()];

        let nested = attenuate(&leaf, &attenuate(&mid, &root));
        // intersect(mid, leaf) under the narrowing rule
        let mid_leaf = attenuate(&leaf, &mid);
        let flat = attenuate(&mid_leaf, &root);
        assert_eq!(nested, flat);
    }

    #[test]
    fn item_id_conversion() {
        assert_eq!(
            item_id_to_cap("execute", "tool", "rye/file-system/fs_write"),
            "rye.execute.tool.rye.file-system.fs_write"
        );
        assert_eq!(search_cap("directive"), "rye.search.directive");
    }
}
