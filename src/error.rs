use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to reconcile {kind} {namespace}/{name}: {source}")]
    ResourceOperation {
        kind: String,
        namespace: String,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{message}: {source}")]
    DatabasePreparation {
        message: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    ResourceCreation(String),

    #[error("Keycloak error: {0}")]
    Keycloak(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Identity of the Kubernetes object a failure is attributed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedObject {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn keycloak(msg: impl Into<String>) -> Self {
        Self::Keycloak(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Attach the identity of the object being acted on.
    pub fn on_resource(self, kind: &str, namespace: &str, name: &str) -> Self {
        Self::ResourceOperation {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            source: Box::new(self),
        }
    }

    /// Innermost object identity found along the error chain. The innermost
    /// wrapper is the one closest to the failing API call.
    pub fn failed_object(&self) -> Option<FailedObject> {
        match self {
            Self::ResourceOperation {
                kind,
                namespace,
                name,
                source,
            } => source.failed_object().or_else(|| {
                Some(FailedObject {
                    kind: kind.clone(),
                    namespace: namespace.clone(),
                    name: name.clone(),
                })
            }),
            Self::DatabasePreparation { source, .. } => source.failed_object(),
            _ => None,
        }
    }

    /// The full source chain, one cause per line.
    pub fn detail(&self) -> String {
        let mut out = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(c) = cause {
            out.push_str("\ncaused by: ");
            out.push_str(&c.to_string());
            cause = c.source();
        }
        out
    }

    /// True for optimistic-lock conflicts reported by the API server.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(e)) if e.code == 409)
    }
}

/// Shorthand used by the cluster facade to tag failures with the object identity.
pub trait ResultExt<T> {
    fn on_resource(self, kind: &str, namespace: &str, name: &str) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn on_resource(self, kind: &str, namespace: &str, name: &str) -> Result<T> {
        self.map_err(|e| e.into().on_resource(kind, namespace, name))
    }
}
