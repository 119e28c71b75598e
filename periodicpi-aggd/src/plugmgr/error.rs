use thiserror::Error;

/// Errors surfaced by the module manager and by the custom methods it routes.
#[derive(Error, Debug)]
pub enum ManagerError {
    /// No custom method, property or driver method under that key.
    #[error("not available: {0}")]
    NotAvailable(String),

    /// Hook was never declared with `install_custom_hook`.
    #[error("hook not available: {0}")]
    HookNotAvailable(String),

    /// Unknown descriptor, missing argument or failed construction.
    #[error("could not load module {module}: {reason}")]
    ModuleLoad { module: String, reason: String },

    #[error("module already loaded: {0}")]
    ModuleAlreadyLoaded(String),

    #[error("module not loaded: {0}")]
    ModuleNotLoaded(String),

    /// An active node with this element id is already registered.
    #[error("active node already registered: {0}")]
    DuplicateNode(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("property {property} does not allow {access}")]
    PropertyPermission { property: String, access: &'static str },

    /// Driver-specific failure, raised from a factory or a driver method.
    #[error("driver {module} failed: {source}")]
    Driver {
        module: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ManagerError {
    pub fn load(module: impl Into<String>, reason: impl Into<String>) -> Self {
        ManagerError::ModuleLoad {
            module: module.into(),
            reason: reason.into(),
        }
    }

    pub fn driver(
        module: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        ManagerError::Driver {
            module: module.into(),
            source: source.into(),
        }
    }
}

/// Result type for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;
