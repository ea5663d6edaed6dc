use miette::Diagnostic;
use thiserror::Error;

/// How the runner should treat a failed reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The Environment or template is missing something; retrying soon will not help
    Configuration,
    /// The world has not converged yet (provider still working, VM still booting)
    NotReady,
    /// Reading or writing the resource store failed
    Store,
    /// Anything else
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Configuration => "configuration",
            ErrorClass::NotReady => "not_ready",
            ErrorClass::Store => "store",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// Controller error type for reconcile passes
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// Required Environment setting is absent
    #[error("No {setting} found in environment '{environment}' ({provider})")]
    #[diagnostic(
        code(hfshim::controller::missing_setting),
        help("Add '{setting}' to spec.environmentSpecifics of environment '{environment}'")
    )]
    MissingSetting {
        #[allow(unused)]
        provider: String,
        #[allow(unused)]
        environment: String,
        #[allow(unused)]
        setting: String,
    },

    /// Required per-template setting is absent
    #[error("No {setting} specified for template '{template}' in environment '{environment}'")]
    #[diagnostic(
        code(hfshim::controller::missing_template_setting),
        help("Add '{setting}' under spec.templateMapping.{template} of environment '{environment}'")
    )]
    MissingTemplateSetting {
        #[allow(unused)]
        environment: String,
        #[allow(unused)]
        template: String,
        #[allow(unused)]
        setting: String,
    },

    /// A VirtualMachine points at an object that does not exist
    #[error("{kind} '{name}' referenced by the VirtualMachine does not exist")]
    #[diagnostic(
        code(hfshim::controller::missing_reference),
        help("Create the {kind} or fix the reference on the VirtualMachine")
    )]
    MissingReference {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        name: String,
    },

    /// Cloud-init document could not be parsed or rendered
    #[error("Invalid cloud-init document: {message}")]
    #[diagnostic(
        code(hfshim::controller::invalid_cloud_init),
        help("The template cloudInit must be a YAML mapping, optionally base64-encoded")
    )]
    InvalidCloudInit {
        #[allow(unused)]
        message: String,
    },

    /// Provider-side work has not finished yet
    #[error("{message}")]
    #[diagnostic(
        code(hfshim::controller::not_ready),
        help("This is expected while the provider converges; the VM is retried with backoff")
    )]
    NotReady {
        #[allow(unused)]
        message: String,
    },

    /// Remote shell connection or command failed
    #[error("Liveness check against {address} failed: {message}")]
    #[diagnostic(
        code(hfshim::controller::liveness_failed),
        help("The instance may still be booting. Verify port 22 is reachable and the key pair was installed")
    )]
    LivenessFailed {
        #[allow(unused)]
        address: String,
        #[allow(unused)]
        message: String,
    },

    /// Key pair generation or decoding failed
    #[error("SSH key error: {message}")]
    #[diagnostic(
        code(hfshim::controller::key_error),
        help("The credential Secret must hold an OpenSSH private key under 'private_key'")
    )]
    KeyError {
        #[allow(unused)]
        message: String,
    },

    /// Invalid process configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(hfshim::controller::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] hfshim_core::ShimError),

    /// Storage error
    #[error(transparent)]
    #[diagnostic(transparent)]
    StorageError(#[from] hfshim_storage::StorageError),

    /// Internal error
    #[error("Internal controller error: {message}")]
    #[diagnostic(
        code(hfshim::controller::internal_error),
        help("This is likely a bug in hfshim-controller. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn missing_setting(
        provider: impl Into<String>,
        environment: impl Into<String>,
        setting: impl Into<String>,
    ) -> Self {
        Self::MissingSetting {
            provider: provider.into(),
            environment: environment.into(),
            setting: setting.into(),
        }
    }

    pub fn missing_template_setting(
        environment: impl Into<String>,
        template: impl Into<String>,
        setting: impl Into<String>,
    ) -> Self {
        Self::MissingTemplateSetting {
            environment: environment.into(),
            template: template.into(),
            setting: setting.into(),
        }
    }

    pub fn missing_reference(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::MissingReference {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn invalid_cloud_init(message: impl Into<String>) -> Self {
        Self::InvalidCloudInit {
            message: message.into(),
        }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::NotReady {
            message: message.into(),
        }
    }

    pub fn liveness_failed(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LivenessFailed {
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::KeyError {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Classify this error for retry scheduling
    pub fn class(&self) -> ErrorClass {
        use hfshim_core::ShimError;

        match self {
            Self::MissingSetting { .. }
            | Self::MissingTemplateSetting { .. }
            | Self::MissingReference { .. }
            | Self::InvalidCloudInit { .. }
            | Self::InvalidConfig { .. } => ErrorClass::Configuration,
            Self::CoreError(ShimError::UnknownProvider { .. })
            | Self::CoreError(ShimError::InvalidResource { .. }) => ErrorClass::Configuration,
            Self::NotReady { .. } | Self::LivenessFailed { .. } => ErrorClass::NotReady,
            Self::StorageError(_) => ErrorClass::Store,
            Self::CoreError(_) | Self::KeyError { .. } | Self::InternalError { .. } => {
                ErrorClass::Fatal
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::StorageError(e) if e.is_not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            ControllerError::missing_setting("ec2", "aws", "cred_secret").class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            ControllerError::from(hfshim_core::ShimError::unknown_provider("vsphere")).class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            ControllerError::not_ready("droplet importKeyPair not yet processed").class(),
            ErrorClass::NotReady
        );
        assert_eq!(
            ControllerError::from(hfshim_storage::StorageError::conflict("k", "1", "2")).class(),
            ErrorClass::Store
        );
    }

    #[test]
    fn test_missing_setting_message() {
        let err = ControllerError::missing_setting("ec2", "aws-east", "cred_secret");
        assert_eq!(
            err.to_string(),
            "No cred_secret found in environment 'aws-east' (ec2)"
        );
    }
}
