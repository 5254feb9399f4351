use std::time::Duration;

use common::RegistryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("App is not installed on device")]
    NotInstalled,

    #[error("no identity reply from device within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("cannot parse identity reply: {0}")]
    HandshakeParseFailure(String),

    #[error("enrollment did not complete within {0:?}")]
    PipelineTimeout(Duration),

    #[error("{step} failed: {source}")]
    PipelineStepFailure {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("bridge error: {0}")]
    Bridge(#[source] anyhow::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl AgentError {
    pub fn step(step: &'static str) -> impl FnOnce(anyhow::Error) -> AgentError {
        move |source| AgentError::PipelineStepFailure { step, source }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
