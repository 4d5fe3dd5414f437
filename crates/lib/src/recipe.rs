//! Recipe loading: the package declaration the build pipeline consumes.
//!
//! A recipe is a TOML file naming the package, its dependencies, the ordered
//! build steps and where the source comes from:
//!
//! ```toml
//! name = "hello"
//! version = "2.12"
//!
//! [build_depends]
//! gcc = {}
//! make = { version = ">= 4" }
//!
//! [source]
//! url = "https://example.com/hello-2.12.tar.gz"
//! sha256 = "…"
//! patches = ["fix-build.diff", { file = "paths.diff", chdir = "src" }]
//!
//! [[steps]]
//! name = "configure"
//! run = "./configure --prefix=/usr"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::hints::Hints;
use crate::source::{
    null::Null, PatchDecl, Patched, Source, SourceError, SourceOptions, SourceTypes,
};

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("recipe not found: {}", .path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid recipe {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Whether and how a dependency is installed into the build container.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Install {
    /// Install the dependency itself (`true`, the default) or skip it.
    Flag(bool),
    /// Install this package instead.
    Package(String),
}

impl Default for Install {
    fn default() -> Self {
        Install::Flag(true)
    }
}

/// A dependency declaration: either a bare version-constraint string or a
/// table with constraint and install behavior.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(from = "DependencyDecl")]
pub struct Dependency {
    pub version: Option<String>,
    pub install: Install,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyDecl {
    Version(String),
    Table {
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        install: Install,
    },
}

impl From<DependencyDecl> for Dependency {
    fn from(decl: DependencyDecl) -> Self {
        match decl {
            DependencyDecl::Version(version) => Self {
                version: Some(version),
                install: Install::default(),
            },
            DependencyDecl::Table { version, install } => Self { version, install },
        }
    }
}

/// One named build step.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub run: String,
}

/// Source declaration: a location plus kind-specific options.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDecl {
    pub url: String,
    #[serde(flatten)]
    pub options: SourceOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recipe {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub build_depends: BTreeMap<String, Dependency>,
    #[serde(default)]
    pub depends: BTreeMap<String, Dependency>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub source: Option<SourceDecl>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

impl Recipe {
    /// Load a recipe from disk. Relative locations inside the recipe (a
    /// `./src` source, patch files) are rebased onto the recipe's own
    /// directory, so a recipe means the same thing from any working
    /// directory.
    pub fn load(path: &Path) -> Result<Self, RecipeError> {
        let content = fs::read_to_string(path).map_err(|source| RecipeError::NotFound {
            path: path.to_path_buf(),
            source,
        })?;
        let mut recipe: Recipe =
            toml::from_str(&content).map_err(|source| RecipeError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if let Some(base) = path.parent() {
            recipe.rebase(base);
        }
        Ok(recipe)
    }

    fn rebase(&mut self, base: &Path) {
        let Some(decl) = self.source.as_mut() else {
            return;
        };
        if decl.url.starts_with("./") || decl.url.starts_with("../") {
            let joined = base.join(decl.url.as_str());
            decl.url = joined.to_string_lossy().into_owned();
        }
        for patch in &mut decl.options.patches {
            let file = match patch {
                PatchDecl::Path(file) => file,
                PatchDecl::Entry { file, .. } => file,
            };
            if !Path::new(file).is_absolute() {
                let joined = base.join(file.as_str());
                *file = joined.to_string_lossy().into_owned();
            }
        }
    }

    /// Resolve the declared source into a concrete [`Source`]: guess the
    /// kind (or honor an explicit override), build the variant, and wrap it
    /// with the patch decorator when patches are declared. A recipe without
    /// a source yields the null source.
    pub fn source(
        &self,
        types: &SourceTypes,
        hints: Arc<dyn Hints>,
    ) -> Result<Box<dyn Source>, SourceError> {
        let Some(decl) = &self.source else {
            return Ok(Box::new(Null));
        };
        let ty = types.guess(&decl.url, decl.options.with.as_deref())?;
        let inner = ty.build(&decl.url, &decl.options)?;
        Ok(Patched::decorate(
            decl.options.patches.clone(),
            inner,
            hints,
        ))
    }
}
