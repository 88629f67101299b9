use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::{ItemEntry, ItemStatus, NestedEntries, StatusRegistry};

/// Renders a registry snapshot as markdown grouped by status bucket.
///
/// The output depends only on `registry`: entries are emitted in key order,
/// and the only timestamp printed is the registry's own `updatedAt`.
pub fn build_markdown(registry: &StatusRegistry) -> String {
    let mut out = String::new();

    out.push_str("# Shape registry\n\n");
    let _ = writeln!(
        out,
        "Updated: {}",
        registry.updated_at.as_deref().unwrap_or("never")
    );
    let _ = writeln!(out, "Version: {}", registry.version);

    out.push_str("\n## Scopes\n");
    render_buckets(&mut out, &registry.scopes, "###");

    render_nested(&mut out, "Message keys", &registry.keys_by_scope);
    render_nested(&mut out, "Entity types", &registry.entity_types_by_scope);

    out
}

fn render_nested(out: &mut String, title: &str, sections: &NestedEntries) {
    let _ = write!(out, "\n## {title}\n");
    if sections.is_empty() {
        out.push_str("\n_none_\n");
        return;
    }

    for (scope, entries) in sections {
        let _ = write!(out, "\n### `{scope}`\n");
        render_buckets(out, entries, "####");
    }
}

fn render_buckets(out: &mut String, entries: &BTreeMap<String, ItemEntry>, heading: &str) {
    for status in ItemStatus::ALL {
        let bucket: Vec<(&String, &ItemEntry)> = entries
            .iter()
            .filter(|(_, entry)| entry.status == status)
            .collect();

        let _ = write!(out, "\n{heading} {} ({})\n\n", status.as_str(), bucket.len());
        if bucket.is_empty() {
            out.push_str("_none_\n");
            continue;
        }

        for (name, entry) in bucket {
            let _ = write!(out, "- `{name}` seen={}", entry.seen);
            if let Some(sample) = entry.sample.as_deref() {
                let _ = write!(out, " sample=\"{}\"", sample.replace('"', "\\\""));
            }
            if let Some(note) = entry.note.as_deref() {
                let _ = write!(out, " ({note})");
            }
            out.push('\n');
        }
    }
}
