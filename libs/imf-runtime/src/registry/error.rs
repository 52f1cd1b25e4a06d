/// Errors raised while building, initializing or querying the registry.
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("service '{name}' not found")]
    ServiceNotFound { name: String },

    #[error("service '{name}' is already registered")]
    DuplicateService { name: String },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("service '{service}' depends on unknown service '{dependency}'")]
    MissingDependency { service: String, dependency: String },

    #[error("service '{service}' failed to initialize: {source:#}")]
    Initialization {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("service '{name}' is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("registry is already initialized")]
    AlreadyInitialized,
}

impl RegistryError {
    /// Name of the service the error is about, when there is one.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::ServiceNotFound { name }
            | Self::DuplicateService { name }
            | Self::TypeMismatch { name, .. } => Some(name),
            Self::MissingDependency { service, .. } | Self::Initialization { service, .. } => {
                Some(service)
            }
            Self::CyclicDependency { path } => path.first().map(String::as_str),
            Self::AlreadyInitialized => None,
        }
    }
}
