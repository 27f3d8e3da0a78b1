//! `@TOKEN@` substitution.
//!
//! Tokens are upper-case identifiers between two `@`. Substitution happens in
//! a single left-to-right pass, so a value containing `@X@` is never expanded
//! again. A token with no value in the context is an error.
//!
//! Paths and names go through [`TemplateContext::configure_path`], which also
//! rejects any other `@...@` span (such as `@arch@`), since a path component
//! like that is always a typo.

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::BuildError;

const TOKEN_PATTERN: &str = r"@([A-Z][A-Z0-9_]*)@";
const AT_SPAN_PATTERN: &str = r"@([^@/\s]+)@";

fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> Result<&'static Regex> {
    if let Some(regex) = cell.get() {
        return Ok(regex);
    }
    let regex = Regex::new(pattern).with_context(|| format!("compiling pattern '{pattern}'"))?;
    Ok(cell.get_or_init(|| regex))
}

fn token_regex() -> Result<&'static Regex> {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    compiled(&TOKEN, TOKEN_PATTERN)
}

fn at_span_regex() -> Result<&'static Regex> {
    static AT_SPAN: OnceLock<Regex> = OnceLock::new();
    compiled(&AT_SPAN, AT_SPAN_PATTERN)
}

/// Named values available to templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    tokens: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`TemplateContext::insert`].
    pub fn with(mut self, token: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(token, value);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, value: impl Into<String>) {
        self.tokens.insert(token.into(), value.into());
    }

    /// Add every entry of `tokens`, replacing existing values.
    pub fn extend<'a>(&mut self, tokens: impl IntoIterator<Item = (&'a String, &'a String)>) {
        for (token, value) in tokens {
            self.insert(token.clone(), value.clone());
        }
    }

    /// Replace every `@TOKEN@` in `text`.
    pub fn configure(&self, text: &str) -> Result<String> {
        if let Some(missing) = self.unknown_tokens(text)?.into_iter().next() {
            return Err(BuildError::UnknownToken {
                token: missing,
                template: text.to_string(),
            }
            .into());
        }
        Ok(token_regex()?
            .replace_all(text, |caps: &Captures<'_>| {
                self.tokens
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned())
    }

    /// [`TemplateContext::configure`] for paths, globs and file names.
    ///
    /// Every `@...@` span must name a known token.
    pub fn configure_path(&self, text: &str) -> Result<String> {
        for caps in at_span_regex()?.captures_iter(text) {
            if !self.tokens.contains_key(&caps[1]) {
                return Err(BuildError::UnknownToken {
                    token: caps[1].to_string(),
                    template: text.to_string(),
                }
                .into());
            }
        }
        self.configure(text)
    }

    /// Tokens referenced by `text` that have no value here.
    pub fn unknown_tokens(&self, text: &str) -> Result<Vec<String>> {
        Ok(token_regex()?
            .captures_iter(text)
            .map(|caps| caps[1].to_string())
            .filter(|token| !self.tokens.contains_key(token))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TemplateContext {
        TemplateContext::new()
            .with("ARCH", "x64")
            .with("PROJECT_VERSION", "3.2.0")
    }

    #[test]
    fn test_configure_replaces_tokens() {
        let ctx = context();
        assert_eq!(
            ctx.configure("lib/@ARCH@/SDL3-@PROJECT_VERSION@.dll").unwrap(),
            "lib/x64/SDL3-3.2.0.dll"
        );
        assert_eq!(ctx.configure("no tokens").unwrap(), "no tokens");
    }

    #[test]
    fn test_unknown_token_is_error() {
        let err = context().configure("bin/@TRIPLET@/").unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::UnknownToken { token, .. }) => assert_eq!(token, "TRIPLET"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let ctx = TemplateContext::new().with("A", "@B@").with("B", "nope");
        assert_eq!(ctx.configure("@A@").unwrap(), "@B@");
    }

    #[test]
    fn test_path_rejects_any_leftover_at_span() {
        let ctx = context();
        for template in ["lib/@arch@", "bin/@Triplet@/x.dll", "@ARCH@/@9@"] {
            let err = ctx.configure_path(template).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<BuildError>(),
                    Some(BuildError::UnknownToken { .. })
                ),
                "{template}: {err:#}"
            );
        }
        assert_eq!(ctx.configure_path("lib/@ARCH@/@ARCH@.dll").unwrap(), "lib/x64/x64.dll");
        assert_eq!(ctx.configure_path("icons/logo@2x.png").unwrap(), "icons/logo@2x.png");
    }

    #[test]
    fn test_lowercase_at_signs_are_left_alone() {
        let ctx = context();
        assert_eq!(
            ctx.configure("mail dev@example.org for @ARCH@").unwrap(),
            "mail dev@example.org for x64"
        );
    }
}
