use common::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Artifact type has to be debug")]
    NotDebugArtifact,
    #[error("Test artifact not found")]
    TestArtifactNotFound,
    #[error("No device found")]
    NoDeviceFound,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
