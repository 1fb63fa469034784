//! Markdown renderer: turns a destination's subtree into a nested bullet list.
//!
//! Every line ends with `\n`. Directories render as bold labels, files as
//! links whose target is wrapped in angle brackets so the chat platform does
//! not expand a preview for each one.

use crate::partition::{Destination, Scope};
use crate::tree::TreeNode;

const INDENT: &str = "  ";

/// Renders `destination` against `base_url`. Pure, no I/O.
pub fn render(destination: &Destination<'_>, base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    let mut out = String::new();
    match destination.scope {
        Scope::Subtree => render_children(destination.node, base_url, 0, &mut out),
        Scope::DirectFiles => {
            for child in destination.node.sorted_children() {
                if child.is_file {
                    push_file(child, base_url, 0, &mut out);
                }
            }
        }
    }
    out
}

fn render_children(node: &TreeNode, base_url: &str, depth: usize, out: &mut String) {
    for child in node.sorted_children() {
        if child.is_file {
            push_file(child, base_url, depth, out);
        } else {
            push_indent(depth, out);
            out.push_str("* **");
            out.push_str(&escape_label(&child.name));
            out.push_str("**\n");
            render_children(child, base_url, depth + 1, out);
        }
    }
}

fn push_file(node: &TreeNode, base_url: &str, depth: usize, out: &mut String) {
    push_indent(depth, out);
    out.push_str("* [");
    out.push_str(&escape_label(&node.name));
    out.push_str("](<");
    out.push_str(&file_link(base_url, &node.full_path));
    out.push_str(">)\n");
}

fn push_indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
}

/// `base_url/segment/segment`, each segment percent-encoded on its own.
pub fn file_link(base_url: &str, full_path: &str) -> String {
    let encoded: Vec<String> = full_path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}/{}", base_url.trim_end_matches('/'), encoded.join("/"))
}

/// Backslash-escapes markdown metacharacters so names render literally.
pub fn escape_label(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, '\\' | '*' | '_' | '`' | '[' | ']' | '~' | '|' | '<' | '>') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
