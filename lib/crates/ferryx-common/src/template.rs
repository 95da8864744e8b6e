//! Operation template rendering.
//!
//! Substitution is best-effort: any value that is absent renders as the
//! empty string, so rendering never fails.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::contract::placeholder;
use crate::meta::{self, MetaValue};

/// Template written by the bootstrapper when a group has no `run.sh` yet.
pub const DEFAULT_TEMPLATE: &str = r#"#!/usr/bin/env bash

echo "Target={{ferryx_Target}}"
echo "Tag={{ferryx_Tag}}"
echo "Env={{ferryx_Env}}"
echo "Group={{ferryx_Group}}"
echo "Meta.test={{ferryx_Meta.test}}"
"#;

static META_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\{\{ferryx_Meta\.([^{}]*)\}\}").expect("static placeholder regex")
});

/// Per-event values for the simple placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderContext<'a> {
    pub env: Option<&'a str>,
    pub target: Option<&'a str>,
    pub tag: Option<&'a str>,
    pub group: Option<&'a str>,
}

/// Renders `template` in two passes: literal `{{ferryx_<Name>}}` placeholders
/// first, then `{{ferryx_Meta.<path>}}` placeholders over the whole result.
#[must_use]
pub fn render(template: &str, ctx: &RenderContext<'_>, meta: Option<&MetaValue>) -> String {
    let simple = [
        (placeholder::ENV, ctx.env),
        (placeholder::TARGET, ctx.target),
        (placeholder::TAG, ctx.tag),
        (placeholder::GROUP, ctx.group),
    ];

    let mut text = template.to_string();
    for (token, value) in simple {
        if text.contains(token) {
            text = text.replace(token, value.unwrap_or_default());
        }
    }

    if !text.contains(placeholder::META_PREFIX) {
        return text;
    }

    META_PLACEHOLDER
        .replace_all(&text, |caps: &Captures<'_>| {
            meta::resolve(meta, &caps[1]).unwrap_or_default()
        })
        .into_owned()
}
