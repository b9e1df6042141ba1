//! Kustomize overlays: discovery, target paths and hydration.

pub mod hydrate;
pub mod overlay;
pub mod target;

pub use hydrate::{hydrate_overlays, plan_targets, Hydrator, KustomizeCli};
pub use overlay::{discover_kustomizations, ExcludeDirs, ImageEntry, KustomizationDoc};
pub use target::{generate_target_path, TargetPath};
