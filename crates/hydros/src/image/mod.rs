//! Image references, pinning policy and registry resolvers.

pub mod oci;
pub mod policy;
pub mod reference;
pub mod resolver;

pub use oci::OciResolver;
pub use policy::{
    pick_display_tag, resolve_strategy, ImageRepoMatch, ImageTagPolicy, PinningRule,
    RepoMatchType, Strategy, EXCLUDED_DISPLAY_TAGS,
};
pub use reference::DockerImageRef;
pub use resolver::{Resolver, ResolverFactory, ResolverSet};

use crate::config::RegistryCredential;
use crate::error::Result;

/// Resolvers used when none are injected: one OCI backend for every host.
pub fn default_resolvers(credentials: &[RegistryCredential]) -> Result<ResolverSet> {
    ResolverSet::new().with(".*", Box::new(OciResolver::new(credentials)?))
}
