use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Coarse classification of a rejected control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedControlMessage,
    VersionMismatch,
    NameConflict,
    NameNotFound,
    LoadFailure,
    ConfigurationInvalid,
    PersistenceFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedControlMessage => "malformed",
            ErrorKind::VersionMismatch => "version_mismatch",
            ErrorKind::NameConflict => "name_conflict",
            ErrorKind::NameNotFound => "name_not_found",
            ErrorKind::LoadFailure => "load_failure",
            ErrorKind::ConfigurationInvalid => "configuration_invalid",
            ErrorKind::PersistenceFailure => "persistence_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Malformed control message: {reason}")]
    Malformed { reason: String },

    #[error("Control message version {actual} does not match pipeline version {expected}")]
    VersionMismatch { expected: String, actual: String },

    #[error("Can't create plugin '{name}': a plugin with the same name already exists")]
    NameConflict { name: String },

    #[error("No plugin named '{name}' found")]
    NameNotFound { name: String },

    #[error("Failed to load plugin '{name}': {source}")]
    Load {
        name: String,
        #[source]
        source: LoadError,
    },

    #[error("Invalid configuration for plugin '{name}': {source}")]
    ConfigurationInvalid {
        name: String,
        #[source]
        source: PluginError,
    },

    #[error("Failed to persist descriptor for '{name}': {source}")]
    Persistence {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Malformed { .. } => ErrorKind::MalformedControlMessage,
            ControlError::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            ControlError::NameConflict { .. } => ErrorKind::NameConflict,
            ControlError::NameNotFound { .. } => ErrorKind::NameNotFound,
            ControlError::Load { .. } => ErrorKind::LoadFailure,
            ControlError::ConfigurationInvalid { .. } => ErrorKind::ConfigurationInvalid,
            ControlError::Persistence { .. } => ErrorKind::PersistenceFailure,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ControlError::Malformed {
            reason: reason.into(),
        }
    }

    /// Splits plugin-side validation failures out of the generic load path.
    pub(crate) fn from_load(name: &str, error: LoadError) -> Self {
        match error {
            LoadError::Construction { source, .. } if source.is_configuration() => {
                ControlError::ConfigurationInvalid {
                    name: name.to_string(),
                    source,
                }
            }
            other => ControlError::Load {
                name: name.to_string(),
                source: other,
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Bad archive location '{location}': {reason}")]
    MalformedArchive { location: String, reason: String },

    #[error("Plugin type '{type_name}' not found")]
    TypeNotFound { type_name: String },

    #[error("Failed to open plugin library {path}: {reason}")]
    Library { path: String, reason: String },

    #[error("Plugin library {path} has no pipeline_plugin_declaration export")]
    MissingEntryPoint { path: String },

    #[error("Plugin library {path} was built for ABI {actual_abi} / host {actual_host}, expected ABI {expected_abi} / host {expected_host}")]
    AbiMismatch {
        path: String,
        expected_abi: u32,
        actual_abi: u32,
        expected_host: String,
        actual_host: String,
    },

    #[error("Destination '{logical}' could not be resolved: {source}")]
    Destination {
        logical: String,
        #[source]
        source: BusError,
    },

    #[error("Construction of '{type_name}' failed: {source}")]
    Construction {
        type_name: String,
        #[source]
        source: PluginError,
    },
}

#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("No destination bound to name '{0}'")]
    Resolution(String),

    #[error("Message bus is closed")]
    Closed,

    #[error("Subscribe to {destination} failed: {reason}")]
    SubscribeFailed { destination: String, reason: String },

    #[error("Publish to {destination} failed: {reason}")]
    PublishFailed { destination: String, reason: String },
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Template was empty")]
    EmptyTemplate,

    #[error("Template is not well-formed XML: {reason}")]
    InvalidTemplate { reason: String },

    #[error("Query must begin with 'select': {sql}")]
    UnsafeQuery { sql: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String },

    #[error("XML error: {0}")]
    Xml(#[from] XmlError),

    #[error("Failed to publish result: {0}")]
    Publish(#[from] BusError),

    #[error("Failed to start plugin: {reason}")]
    Init { reason: String },

    #[error("Plugin panicked: {reason}")]
    Panicked { reason: String },
}

impl PluginError {
    /// Errors raised while validating a plugin's own configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PluginError::Configuration { .. }
                | PluginError::EmptyTemplate
                | PluginError::InvalidTemplate { .. }
                | PluginError::UnsafeQuery { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum XmlError {
    #[error("Document is not well-formed: {0}")]
    Parse(#[from] roxmltree::Error),

    #[error("No element at path '{0}'")]
    PathNotFound(String),

    #[error("Element at path '{0}' has element children")]
    NotALeaf(String),

    #[error("Invalid path '{0}': paths are absolute, e.g. /root/child")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
