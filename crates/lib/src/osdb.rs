//! Distribution knowledge: platform families and codenames.
//!
//! Instruction generation only needs to know which package manager a target
//! distribution speaks and, occasionally, the codename behind a version
//! number. Both come from a small static table.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Platform family deciding the package-manager invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavour {
    Debian,
    Redhat,
}

impl Flavour {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavour::Debian => "debian",
            Flavour::Redhat => "redhat",
        }
    }
}

impl fmt::Display for Flavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown flavour: {0}")]
pub struct UnknownFlavour(String);

impl FromStr for Flavour {
    type Err = UnknownFlavour;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debian" => Ok(Flavour::Debian),
            "redhat" => Ok(Flavour::Redhat),
            other => Err(UnknownFlavour(other.to_string())),
        }
    }
}

struct OsEntry {
    distribution: &'static str,
    flavour: Flavour,
    /// `(codename, version prefix)` pairs, most recent last.
    codenames: &'static [(&'static str, &'static str)],
}

const OS_DB: &[OsEntry] = &[
    OsEntry {
        distribution: "ubuntu",
        flavour: Flavour::Debian,
        codenames: &[
            ("trusty", "14.04"),
            ("xenial", "16.04"),
            ("bionic", "18.04"),
            ("focal", "20.04"),
            ("jammy", "22.04"),
            ("noble", "24.04"),
        ],
    },
    OsEntry {
        distribution: "debian",
        flavour: Flavour::Debian,
        codenames: &[
            ("jessie", "8"),
            ("stretch", "9"),
            ("buster", "10"),
            ("bullseye", "11"),
            ("bookworm", "12"),
            ("trixie", "13"),
        ],
    },
    OsEntry {
        distribution: "centos",
        flavour: Flavour::Redhat,
        codenames: &[],
    },
    OsEntry {
        distribution: "fedora",
        flavour: Flavour::Redhat,
        codenames: &[],
    },
    OsEntry {
        distribution: "redhat",
        flavour: Flavour::Redhat,
        codenames: &[],
    },
];

fn entry(distribution: &str) -> Option<&'static OsEntry> {
    OS_DB.iter().find(|e| e.distribution == distribution)
}

/// Platform family of a distribution, if known.
pub fn flavour_of(distribution: &str) -> Option<Flavour> {
    entry(distribution).map(|e| e.flavour)
}

/// Codename matching a distribution version, if known. The first codename
/// whose version prefixes the given version wins, so `"22.04.3"` still maps
/// to `jammy`.
pub fn codename_of(distribution: &str, version: &str) -> Option<&'static str> {
    entry(distribution)?
        .codenames
        .iter()
        .find(|(_, prefix)| version.starts_with(prefix))
        .map(|(codename, _)| *codename)
}

/// Resolved build variables handed to instruction generation.
#[derive(Debug, Clone)]
pub struct Variables {
    /// Base image of the source stage.
    pub image: String,
    pub distribution: String,
    pub distribution_version: String,
    pub flavour: Option<Flavour>,
    pub codename: Option<String>,
    /// Refresh the package index before installing build dependencies.
    pub update: bool,
}

impl Variables {
    /// Fill flavour and codename from the distribution table where the
    /// caller did not set them explicitly.
    pub fn resolve(mut self) -> Self {
        if self.flavour.is_none() {
            self.flavour = flavour_of(&self.distribution);
        }
        if self.codename.is_none() {
            self.codename =
                codename_of(&self.distribution, &self.distribution_version).map(str::to_string);
        }
        self
    }
}
