//! Post-hydration transformation functions.

pub mod dispatcher;
pub mod document;
pub mod filters;

pub use dispatcher::{
    discover_functions, function_target_dir, order_functions, DispatchPlan, Function,
    FunctionDispatcher, SOURCE_DIR_ANNOTATION, TARGET_DIR_ANNOTATION,
};
pub use document::{Document, DocumentSet};
pub use filters::{FunctionKind, FunctionRuntime, ImageMapping, FUNCTIONS_API_VERSION};
