//! Model registry and routing.

mod provider;
mod registry;
mod router;
mod spec;

pub use provider::{AuthScheme, ProviderEntry, ProviderKind};
pub use registry::RegistrySnapshot;
pub use router::ModelRouter;
pub use spec::{ApiMode, ModelEntry, ModelInfo, ResolvedRoute};
