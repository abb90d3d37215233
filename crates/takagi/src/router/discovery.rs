// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! RFC 6690 link-format generation for `/.well-known/core`.
//!
//! One link entry per distinct path, attributes merged across the methods
//! registered on it. String attributes are quoted, numeric attributes are
//! bare, `obs` is valueless. Paths are sorted so the body is
//! deterministic.

use super::{CoreAttrs, RouteEntry};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Render the link-format body for a route snapshot.
pub fn link_format(routes: &[Arc<RouteEntry>]) -> String {
    let mut by_path: BTreeMap<&str, CoreAttrs> = BTreeMap::new();

    for entry in routes {
        let merged = by_path.entry(entry.pattern.as_str()).or_default();
        merge(merged, &entry.attrs);
    }

    let links: Vec<String> = by_path
        .iter()
        .map(|(path, attrs)| render_link(path, attrs))
        .collect();
    links.join(",")
}

fn merge(into: &mut CoreAttrs, from: &CoreAttrs) {
    if into.rt.is_none() {
        into.rt = from.rt.clone();
    }
    if into.interface.is_none() {
        into.interface = from.interface.clone();
    }
    if into.title.is_none() {
        into.title = from.title.clone();
    }
    if into.sz.is_none() {
        into.sz = from.sz;
    }
    for ct in &from.ct {
        if !into.ct.contains(ct) {
            into.ct.push(*ct);
        }
    }
    into.obs = into.obs || from.obs;
}

fn render_link(path: &str, attrs: &CoreAttrs) -> String {
    let mut link = format!("<{}>", path);
    if let Some(rt) = &attrs.rt {
        link.push_str(&format!(";rt=\"{}\"", rt));
    }
    if let Some(interface) = &attrs.interface {
        link.push_str(&format!(";if=\"{}\"", interface));
    }
    if !attrs.ct.is_empty() {
        let formats: Vec<String> = attrs.ct.iter().map(u16::to_string).collect();
        if formats.len() == 1 {
            link.push_str(&format!(";ct={}", formats[0]));
        } else {
            link.push_str(&format!(";ct=\"{}\"", formats.join(" ")));
        }
    }
    if let Some(sz) = attrs.sz {
        link.push_str(&format!(";sz={}", sz));
    }
    if let Some(title) = &attrs.title {
        link.push_str(&format!(";title=\"{}\"", title));
    }
    if attrs.obs {
        link.push_str(";obs");
    }
    link
}
