//! kiln-lib: the build-context pipeline behind the `kiln` CLI.
//!
//! Kiln bakes packages inside disposable containers. A recipe names a
//! source; the source resolves to a content-addressed [`source::Cache`]
//! (optionally rewritten by unified diffs), and the cache's archive stream
//! is joined behind generated build instructions into the single tar
//! stream a container runtime expects as its build context.

pub mod dockerfile;
pub mod exec;
pub mod hash;
pub mod hints;
pub mod osdb;
pub mod recipe;
pub mod source;
pub mod tarstream;

pub use dockerfile::{BuildStage, DockerfileError, SourceStage, DOCKERFILE_NAME};
pub use exec::ExecError;
pub use hints::{Hints, LogHints};
pub use osdb::{Flavour, Variables};
pub use recipe::{Recipe, RecipeError};
pub use source::{Cache, Source, SourceError, SourceTypes};
