//! Build instruction generation.
//!
//! A build runs in two container stages. The source stage ships the
//! resolved source into a base image: its context is the generated
//! instruction document joined ahead of the source cache's archive stream.
//! The build stage installs build dependencies and runs the recipe's steps
//! through a generated shell script; its context is a small self-contained
//! archive of the two generated files.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{Cursor, Read};

use thiserror::Error;

use crate::osdb::{Flavour, Variables};
use crate::recipe::{Dependency, Install, Recipe};
use crate::source::Cache;
use crate::tarstream::{self, ArchiveFile, JoinedReader};

/// Name of the generated instruction document inside a build context.
pub const DOCKERFILE_NAME: &str = "Dockerfile.kiln";

/// Name of the generated build script.
pub const BUILD_SCRIPT_NAME: &str = ".build.sh";

/// Directory inside the container where the build runs.
const BUILD_DIR: &str = "/tmp/build";

#[derive(Debug, Error)]
pub enum DockerfileError {
    /// Build dependencies were requested for a platform family with no
    /// package-manager mapping.
    #[error("cannot install build dependencies: unknown platform family for `{distribution}`")]
    UnsupportedFlavour { distribution: String },

    #[error(transparent)]
    Source(#[from] crate::source::SourceError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// First stage: ship the resolved source into the base image.
pub struct SourceStage {
    variables: Variables,
}

impl SourceStage {
    pub fn new(variables: Variables) -> Self {
        Self { variables }
    }

    pub fn dockerfile(&self) -> String {
        let mut df = String::new();
        let _ = writeln!(df, "FROM {}", self.variables.image);
        let _ = writeln!(df, "RUN mkdir {BUILD_DIR}");
        let _ = writeln!(df, "ADD . {BUILD_DIR}");
        df
    }

    /// The complete build context: the marker-less instruction archive
    /// joined ahead of the source archive, one valid tar stream.
    pub fn tar_io(&self, cache: &mut dyn Cache) -> Result<Box<dyn Read + Send>, DockerfileError> {
        let head = tarstream::instruction_archive(&[ArchiveFile {
            name: DOCKERFILE_NAME,
            mode: 0o644,
            content: self.dockerfile().as_bytes(),
        }])?;
        let source = cache.tar_io()?;
        Ok(Box::new(JoinedReader::new(vec![
            Box::new(Cursor::new(head)),
            source,
        ])))
    }
}

/// Second stage: install build dependencies and run the recipe's steps.
pub struct BuildStage<'a> {
    base: String,
    variables: Variables,
    recipe: &'a Recipe,
}

impl<'a> BuildStage<'a> {
    pub fn new(base: impl Into<String>, variables: Variables, recipe: &'a Recipe) -> Self {
        Self {
            base: base.into(),
            variables,
            recipe,
        }
    }

    pub fn dockerfile(&self) -> Result<String, DockerfileError> {
        let mut df = String::new();
        let _ = writeln!(df, "FROM {}", self.base);
        let _ = writeln!(df, "WORKDIR {BUILD_DIR}");

        let deps = self.build_dependencies();
        if !deps.is_empty() {
            let Some(flavour) = self.variables.flavour else {
                return Err(DockerfileError::UnsupportedFlavour {
                    distribution: self.variables.distribution.clone(),
                });
            };
            match flavour {
                Flavour::Debian => {
                    let update = if self.variables.update {
                        "apt-get update && "
                    } else {
                        ""
                    };
                    let _ = writeln!(
                        df,
                        "RUN {update}apt-get install --yes {}",
                        shell_join(&deps)
                    );
                }
                Flavour::Redhat => {
                    let _ = writeln!(df, "RUN yum -y install {}", shell_join(&deps));
                }
            }
        }

        let _ = writeln!(df, "ADD {BUILD_SCRIPT_NAME} {BUILD_DIR}/");
        let _ = writeln!(df, "ENTRYPOINT {BUILD_DIR}/{BUILD_SCRIPT_NAME}");
        Ok(df)
    }

    /// Fail-fast build script: each step announces itself in bold green,
    /// then runs verbatim; the first failure aborts the build.
    pub fn build_sh(&self) -> String {
        let mut sh = String::from("#!/bin/bash\nset -e\n");
        for step in &self.recipe.steps {
            let banner = format!("\\e[1;32m====> {}\\e[0m", step.name);
            let _ = writeln!(sh, "echo -e {}", shell_escape(&banner));
            sh.push_str(&step.run);
            sh.push('\n');
        }
        sh
    }

    /// Self-terminated context archive holding the script and the
    /// instruction document.
    pub fn tar_io(&self) -> Result<Box<dyn Read + Send>, DockerfileError> {
        let bytes = tarstream::file_archive(&[
            ArchiveFile {
                name: BUILD_SCRIPT_NAME,
                mode: 0o755,
                content: self.build_sh().as_bytes(),
            },
            ArchiveFile {
                name: DOCKERFILE_NAME,
                mode: 0o644,
                content: self.dockerfile()?.as_bytes(),
            },
        ])?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    /// Packages installed into the build container: build dependencies
    /// merged under runtime dependencies, `install = false` skipped,
    /// explicit install names substituted, alternatives simplified, sorted
    /// for deterministic output.
    fn build_dependencies(&self) -> Vec<String> {
        let mut merged: BTreeMap<&str, &Dependency> = BTreeMap::new();
        for (name, dep) in &self.recipe.build_depends {
            merged.insert(name.as_str(), dep);
        }
        for (name, dep) in &self.recipe.depends {
            merged.insert(name.as_str(), dep);
        }
        let mut out: Vec<String> = merged
            .into_iter()
            .filter_map(|(name, dep)| match &dep.install {
                Install::Flag(false) => None,
                Install::Flag(true) => Some(simplify(name)),
                Install::Package(other) => Some(simplify(other)),
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

/// `a|b` alternatives install their first choice.
fn simplify(dep: &str) -> String {
    dep.split('|').next().unwrap_or(dep).trim().to_string()
}

/// Quote a word for POSIX shell.
fn shell_escape(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=+:,@".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn shell_join(words: &[String]) -> String {
    words
        .iter()
        .map(|word| shell_escape(word))
        .collect::<Vec<_>>()
        .join(" ")
}
