// src/profile.rs

//! Profiles: the settings, option values and tool injections of one
//! build side (host or target)
//!
//! A graph build always receives two profiles: the host profile
//! configures nodes whose binaries run on the target, the build profile
//! configures tool nodes. Profile build-requires inject tool
//! requirements into every node whose reference matches a pattern:
//! `&` matches the consumer root only, `&!` matches everything except
//! the consumer, anything else is an fnmatch-style glob against the
//! full reference string.

use crate::graph::{OptionsMap, Settings};
use crate::reference::RecipeReference;
use glob::Pattern;
use std::collections::BTreeMap;
use tracing::debug;

/// One build side's configuration
#[derive(Debug, Clone, Default)]
pub struct Profile {
    /// Settings (os, arch, compiler, build_type, ...)
    pub settings: Settings,
    /// Option values scoped `pkg:option` (or `*:option` for any package)
    pub options: BTreeMap<String, String>,
    /// Tool injections: (pattern, tool references)
    pub build_requires: Vec<(String, Vec<RecipeReference>)>,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor from settings pairs
    pub fn with_settings(pairs: &[(&str, &str)]) -> Self {
        let mut profile = Self::new();
        for (key, value) in pairs {
            profile.settings.insert(key.to_string(), value.to_string());
        }
        profile
    }

    /// Option values this profile imposes on one package
    pub fn options_for(&self, package: &str) -> OptionsMap {
        let mut out = OptionsMap::new();
        for (scoped, value) in &self.options {
            match scoped.split_once(':') {
                Some((scope, option)) if scope == package || scope == "*" => {
                    out.insert(option.to_string(), value.clone());
                }
                _ => {}
            }
        }
        out
    }

    /// Tool references to inject into a node whose full reference string
    /// is `ref_str`. Patterns are evaluated in declaration order and
    /// duplicates are kept out.
    pub fn matching_build_requires(&self, ref_str: &str, is_consumer: bool) -> Vec<RecipeReference> {
        let mut out: Vec<RecipeReference> = Vec::new();
        for (pattern, tools) in &self.build_requires {
            if !pattern_matches(pattern, ref_str, is_consumer) {
                continue;
            }
            debug!("profile pattern '{}' matches '{}'", pattern, ref_str);
            for tool in tools {
                if !out.contains(tool) {
                    out.push(tool.clone());
                }
            }
        }
        out
    }
}

/// Pattern semantics: `&` is the consumer, `&!` is everything but the
/// consumer, anything else matches fnmatch-style.
fn pattern_matches(pattern: &str, ref_str: &str, is_consumer: bool) -> bool {
    match pattern {
        "&" => is_consumer,
        "&!" => !is_consumer,
        _ => Pattern::new(pattern)
            .map(|p| p.matches(ref_str))
            .unwrap_or(false),
    }
}
