// src/recipe.rs

//! The recipe capability interface and its declarative implementation
//!
//! The resolver consumes recipes exclusively through the [`Recipe`]
//! trait; it never inspects recipe internals. Any backing is possible
//! (an embedded interpreter, a scripting bridge), but the
//! implementation shipped here is [`DeclaredRecipe`]: a JSON manifest
//! (`recipe.json` inside the recipe's `export/` tree) declaring name,
//! version, settings, options, requirements and provides.

use crate::error::{Error, Result};
use crate::graph::{OptionsMap, Requirement, Settings};
use crate::reference::RecipeReference;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Consumption information a built package exposes to its dependants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CppInfo {
    #[serde(default = "CppInfo::default_includedirs")]
    pub includedirs: Vec<String>,
    #[serde(default = "CppInfo::default_libdirs")]
    pub libdirs: Vec<String>,
    #[serde(default)]
    pub libs: Vec<String>,
    #[serde(default)]
    pub defines: Vec<String>,
}

impl CppInfo {
    fn default_includedirs() -> Vec<String> {
        vec!["include".to_string()]
    }

    fn default_libdirs() -> Vec<String> {
        vec!["lib".to_string()]
    }
}

impl Default for CppInfo {
    fn default() -> Self {
        Self {
            includedirs: Self::default_includedirs(),
            libdirs: Self::default_libdirs(),
            libs: Vec::new(),
            defines: Vec::new(),
        }
    }
}

/// The fixed capability surface the graph builder drives
pub trait Recipe: Send {
    /// The declared package name, when the recipe sets one
    fn name(&self) -> Option<&str>;

    /// The declared version, when the recipe sets one
    fn version(&self) -> Option<&Version>;

    /// Settings this recipe's binaries vary on (empty = all)
    fn settings(&self) -> &[String];

    /// Default values of the recipe's options
    fn default_options(&self) -> OptionsMap;

    /// Adjust configuration before requirements are evaluated.
    ///
    /// `options` arrives pre-merged (defaults, profile values, values
    /// imposed by the requiring edge); the recipe validates and may
    /// adjust it. Failures surface as `RecipeError`.
    fn configure(&mut self, settings: &Settings, options: &mut OptionsMap) -> Result<()>;

    /// Host-context requirements
    fn requirements(&self) -> Result<Vec<Requirement>>;

    /// Build-context requirements (tools)
    fn build_requirements(&self) -> Result<Vec<Requirement>>;

    /// Identifiers this package claims to provide besides its own name
    fn provides(&self) -> Vec<String>;

    /// Consumption info for build-system integration
    fn package_info(&self) -> CppInfo;
}

/// Maps a recipe file on disk to a live recipe object
pub trait RecipeLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn Recipe>>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RequireSpec {
    Simple(String),
    Detailed {
        #[serde(rename = "ref")]
        reference: String,
        #[serde(default, rename = "override")]
        override_only: bool,
        #[serde(default)]
        force: bool,
        #[serde(default)]
        options: OptionsMap,
    },
}

impl RequireSpec {
    fn to_requirement(&self, build: bool) -> Result<Requirement> {
        let requirement = match self {
            RequireSpec::Simple(text) => Requirement::new(RecipeReference::parse(text)?),
            RequireSpec::Detailed {
                reference,
                override_only,
                force,
                options,
            } => {
                let mut requirement = Requirement::new(RecipeReference::parse(reference)?);
                requirement.override_only = *override_only;
                requirement.force = *force;
                requirement.options = options.clone();
                requirement
            }
        };
        Ok(Requirement {
            build,
            ..requirement
        })
    }
}

/// A recipe declared as a JSON manifest
#[derive(Debug, Clone, Deserialize)]
pub struct DeclaredRecipe {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<Version>,
    #[serde(default)]
    settings: Vec<String>,
    #[serde(default)]
    options: BTreeMap<String, String>,
    #[serde(default)]
    requires: Vec<RequireSpec>,
    #[serde(default)]
    build_requires: Vec<RequireSpec>,
    #[serde(default)]
    provides: Vec<String>,
    #[serde(default)]
    cpp_info: Option<CppInfo>,
}

impl DeclaredRecipe {
    /// Parse a recipe manifest from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::RecipeError(format!("invalid recipe: {e}")))
    }

    /// Parse a recipe manifest from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {e}", path.display())))?;
        Self::from_json(&contents).map_err(|e| {
            Error::RecipeError(format!("{} in {}", e, path.display()))
        })
    }

    /// A synthetic recipe carrying only requirements (the virtual root)
    pub fn virtual_root(requires: Vec<Requirement>) -> Self {
        Self {
            name: None,
            version: None,
            settings: Vec::new(),
            options: BTreeMap::new(),
            requires: requires
                .into_iter()
                .map(|r| RequireSpec::Detailed {
                    reference: r.reference.full_str(),
                    override_only: r.override_only,
                    force: r.force,
                    options: r.options,
                })
                .collect(),
            build_requires: Vec::new(),
            provides: Vec::new(),
            cpp_info: None,
        }
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("consumer")
    }
}

impl Recipe for DeclaredRecipe {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    fn settings(&self) -> &[String] {
        &self.settings
    }

    fn default_options(&self) -> OptionsMap {
        self.options.clone()
    }

    fn configure(&mut self, settings: &Settings, options: &mut OptionsMap) -> Result<()> {
        // Every setting the recipe varies on must be configured
        for name in &self.settings {
            if !settings.contains_key(name) {
                return Err(Error::RecipeError(format!(
                    "recipe '{}' requires setting '{}' which the profile does not define",
                    self.display_name(),
                    name
                )));
            }
        }

        // Options must exist in the recipe's declaration
        for name in options.keys() {
            if !self.options.contains_key(name) {
                return Err(Error::RecipeError(format!(
                    "recipe '{}' has no option '{}'",
                    self.display_name(),
                    name
                )));
            }
        }

        Ok(())
    }

    fn requirements(&self) -> Result<Vec<Requirement>> {
        self.requires.iter().map(|r| r.to_requirement(false)).collect()
    }

    fn build_requirements(&self) -> Result<Vec<Requirement>> {
        self.build_requires
            .iter()
            .map(|r| r.to_requirement(true))
            .collect()
    }

    fn provides(&self) -> Vec<String> {
        self.provides.clone()
    }

    fn package_info(&self) -> CppInfo {
        self.cpp_info.clone().unwrap_or_default()
    }
}

/// Loader for JSON recipe manifests
#[derive(Debug, Default)]
pub struct JsonRecipeLoader;

impl RecipeLoader for JsonRecipeLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn Recipe>> {
        Ok(Box::new(DeclaredRecipe::from_file(path)?))
    }
}
