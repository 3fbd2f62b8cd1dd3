use crate::hypervisor::HypervisorError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("Invalid configuration")]
    InvalidConfig,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Domain XML error: {0}")]
    Xml(String),

    #[error("Unsupported volume driver type '{0}'")]
    UnsupportedVolumeDriver(String),

    #[error("Invalid connection info: {0}")]
    InvalidConnectionInfo(String),

    #[error("No migration in progress for instance {0}")]
    MigrationNotRunning(Uuid),

    #[error("Record '{0}' not found")]
    RecordNotFound(String),

    #[error("System command failed: {0}")]
    SystemCommandFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(String),
}

impl From<toml::de::Error> for MigrationError {
    fn from(err: toml::de::Error) -> Self {
        MigrationError::SerdeError(err.to_string())
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        MigrationError::SerdeError(err.to_string())
    }
}

impl From<quick_xml::Error> for MigrationError {
    fn from(err: quick_xml::Error) -> Self {
        MigrationError::Xml(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for MigrationError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        MigrationError::Xml(err.to_string())
    }
}
