/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use thiserror::Error;

/**
 * The failure classes of a provisioning run.  These travel inside
 * anyhow::Error so that stage code can use "?" and "bail!" freely; the
 * command line front end downcasts to decide how to report the failure.
 */
#[derive(Debug, Error)]
pub enum ProvisionError {
    /*
     * Bad or missing input, including unresolved template placeholders.
     * Raised before any destructive action wherever possible.
     */
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{command} failed (exit status {status}): {stderr}")]
    ToolInvocation {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("verification failed: {0}")]
    Verification(String),

    /*
     * Cleanup ran to completion but live state remains.  Terminal: this is
     * never fed back into another cleanup pass.
     */
    #[error("residual state after cleanup: {}", .0.join("; "))]
    ResidualState(Vec<String>),
}

impl ProvisionError {
    pub fn config<S: Into<String>>(msg: S) -> anyhow::Error {
        ProvisionError::Configuration(msg.into()).into()
    }

    pub fn verify<S: Into<String>>(msg: S) -> anyhow::Error {
        ProvisionError::Verification(msg.into()).into()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::Configuration(_) => "ConfigurationError",
            ProvisionError::ToolInvocation { .. } => "ToolInvocationError",
            ProvisionError::Verification(_) => "VerificationError",
            ProvisionError::ResidualState(_) => "ResidualStateError",
        }
    }
}

/**
 * Find the typed provisioning error, if any, somewhere in the chain of an
 * anyhow error.
 */
pub fn classify(e: &anyhow::Error) -> Option<&ProvisionError> {
    e.chain().find_map(|c| c.downcast_ref::<ProvisionError>())
}
