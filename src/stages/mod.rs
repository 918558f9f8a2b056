//! Pipeline stages
//!
//! The image build produces the runtime image; the docs build runs inside
//! it and hands its output to the publish stage.

pub mod artifact;
pub mod docs;
pub mod image;
pub mod native;
pub mod publish;
pub mod resolver;
pub mod target;

pub use artifact::{Artifact, ArtifactStore};
pub use docs::{BuildOutput, DocsBuilder, RunInfo};
pub use image::{ImageBuilder, ImageReport};
pub use native::{ArchiveFetcher, FetchError, HttpFetcher, NativeArchive};
pub use publish::{PublishReport, Publisher};
pub use resolver::{DependencyGroups, LockState};
pub use target::{CommandTarget, DeployError, DeployReceipt, DeployTarget, DirectoryTarget};
