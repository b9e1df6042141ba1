//! Building images that are missing at the current source commit.

pub mod docker;
pub mod pool;

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::resource::loader::load_kind;
use crate::resource::{ImageResource, ResourceKind};

pub use docker::DockerCliBuilder;
pub use pool::{build_missing, BuildReport};

/// One image to build and the tags to push it under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Repository without a tag.
    pub image: String,
    pub context: PathBuf,
    pub dockerfile: Option<PathBuf>,
    pub tags: Vec<String>,
}

impl BuildRequest {
    /// `image:tag` for every tag.
    pub fn references(&self) -> Vec<String> {
        self.tags
            .iter()
            .map(|tag| format!("{}:{}", self.image, tag))
            .collect()
    }
}

pub trait ImageBuilder: Send + Sync {
    /// Creates the registry repository when the registry needs one up front.
    fn ensure_repository(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    /// Whether `reference` (`image:tag`) is already in the registry.
    fn exists(&self, reference: &str) -> Result<bool>;

    /// Builds and pushes every tag of `request`.
    fn build(&self, request: &BuildRequest) -> Result<()>;
}

/// Build requests for every Image document under `root`, tagged with
/// `commit` and `floating_tag`.
pub fn discover_builds(root: &Path, commit: &str, floating_tag: &str) -> Result<Vec<BuildRequest>> {
    let images: Vec<_> = load_kind::<ImageResource>(root, ResourceKind::Image)?;
    Ok(images
        .into_iter()
        .map(|loaded| {
            let dir = root.join(loaded.path.parent().unwrap_or(Path::new("")));
            let spec = loaded.resource.spec;
            BuildRequest {
                image: spec.image,
                context: dir.join(&spec.context),
                dockerfile: spec.dockerfile.map(|d| dir.join(d)),
                tags: vec![commit.to_string(), floating_tag.to_string()],
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_discover_builds() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("api")).unwrap();
        fs::write(
            root.path().join("api/image.yaml"),
            "apiVersion: hydros.dev/v1alpha1\nkind: Image\nmetadata:\n  name: api\nspec:\n  image: registry.io/acme/api\n  context: src\n  dockerfile: Dockerfile.prod\n---\napiVersion: v1\nkind: ConfigMap\n",
        )
        .unwrap();

        let builds = discover_builds(root.path(), "abc123", "latest").unwrap();
        assert_eq!(builds.len(), 1);
        let build = &builds[0];
        assert_eq!(build.context, root.path().join("api").join("src"));
        assert_eq!(
            build.dockerfile,
            Some(root.path().join("api").join("Dockerfile.prod"))
        );
        assert_eq!(
            build.references(),
            vec!["registry.io/acme/api:abc123", "registry.io/acme/api:latest"]
        );
    }
}
