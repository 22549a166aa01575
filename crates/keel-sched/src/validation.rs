//! Validation of task and executor descriptors.
//!
//! The scheduler itself does not interpret these descriptors; it only
//! refuses to forward ones that the rest of the cluster would reject.

use thiserror::Error;

use crate::codec::TaskDescriptor;

/// The longest id the platform accepts, matching the maximum file name
/// length on the nodes (ids may be mapped to directories).
pub const MAX_ID_LENGTH: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(String);

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

type ValidationResult = Result<(), ValidationError>;

pub fn validate_id(id: &str) -> ValidationResult {
    if id.is_empty() {
        return Err(ValidationError::new("ID must not be empty"));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(ValidationError::new(format!(
            "ID must not be greater than {MAX_ID_LENGTH} characters"
        )));
    }
    // These special path components cannot be ids.
    if id == "." || id == ".." {
        return Err(ValidationError::new(format!("'{id}' is disallowed")));
    }
    // Control characters and path separators are not allowed.
    let invalid = |c: char| c.is_control() || c == '/' || c == '\\';
    if id.chars().any(invalid) {
        return Err(ValidationError::new(format!(
            "'{id}' contains invalid characters"
        )));
    }
    Ok(())
}

pub fn validate_task(task: &TaskDescriptor) -> ValidationResult {
    validate_id(task.slave_id.as_str())
        .map_err(|e| ValidationError::new(format!("invalid slave ID: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Reference,
    Value,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretReference {
    pub name: String,
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub kind: SecretKind,
    pub reference: Option<SecretReference>,
    pub value: Option<Vec<u8>>,
}

pub fn validate_secret(secret: &Secret) -> ValidationResult {
    match secret.kind {
        SecretKind::Reference => {
            let Some(reference) = &secret.reference else {
                return Err(ValidationError::new(
                    "secret of type REFERENCE must have the 'reference' field set",
                ));
            };
            if secret.value.is_some() {
                return Err(ValidationError::new(format!(
                    "secret '{}' of type REFERENCE must not have the 'value' field set",
                    reference.name
                )));
            }
            Ok(())
        }
        SecretKind::Value => {
            if secret.value.is_none() {
                return Err(ValidationError::new(
                    "secret of type VALUE must have the 'value' field set",
                ));
            }
            if secret.reference.is_some() {
                return Err(ValidationError::new(
                    "secret of type VALUE must not have the 'reference' field set",
                ));
            }
            Ok(())
        }
        SecretKind::Unknown => Err(ValidationError::new("secret of type UNKNOWN is not allowed")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentVariableKind {
    Value,
    Secret,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentVariable {
    pub name: String,
    pub kind: EnvironmentVariableKind,
    pub value: Option<String>,
    pub secret: Option<Secret>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    pub variables: Vec<EnvironmentVariable>,
}

pub fn validate_environment(environment: &Environment) -> ValidationResult {
    for variable in &environment.variables {
        if variable.name.is_empty() {
            return Err(ValidationError::new(
                "environment variable names must not be empty",
            ));
        }
        if variable.name.contains('\0') {
            return Err(ValidationError::new(format!(
                "environment variable name '{}' contains a NUL byte",
                variable.name.escape_default()
            )));
        }
        match variable.kind {
            EnvironmentVariableKind::Value => {
                let Some(value) = &variable.value else {
                    return Err(ValidationError::new(format!(
                        "environment variable '{}' of type VALUE must have a value set",
                        variable.name
                    )));
                };
                if variable.secret.is_some() {
                    return Err(ValidationError::new(format!(
                        "environment variable '{}' of type VALUE must not have a secret set",
                        variable.name
                    )));
                }
                if value.contains('\0') {
                    return Err(ValidationError::new(format!(
                        "value of environment variable '{}' contains a NUL byte",
                        variable.name
                    )));
                }
            }
            EnvironmentVariableKind::Secret => {
                let Some(secret) = &variable.secret else {
                    return Err(ValidationError::new(format!(
                        "environment variable '{}' of type SECRET must have a secret set",
                        variable.name
                    )));
                };
                if variable.value.is_some() {
                    return Err(ValidationError::new(format!(
                        "environment variable '{}' of type SECRET must not have a value set",
                        variable.name
                    )));
                }
                validate_secret(secret).map_err(|e| {
                    ValidationError::new(format!(
                        "environment variable '{}' has an invalid secret: {e}",
                        variable.name
                    ))
                })?;
                if let Some(value) = &secret.value {
                    if value.contains(&0) {
                        return Err(ValidationError::new(format!(
                            "secret of environment variable '{}' contains a NUL byte",
                            variable.name
                        )));
                    }
                }
            }
            EnvironmentVariableKind::Unknown => {
                return Err(ValidationError::new(
                    "environment variable of type UNKNOWN is not allowed",
                ));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandInfo {
    pub value: Option<String>,
    pub arguments: Vec<String>,
    pub environment: Environment,
}

pub fn validate_command(command: &CommandInfo) -> ValidationResult {
    validate_environment(&command.environment)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Volume {
    pub container_path: String,
    pub host_path: Option<String>,
    pub image: Option<String>,
    pub source: Option<String>,
}

pub fn validate_volume(volume: &Volume) -> ValidationResult {
    if volume.container_path.is_empty() {
        return Err(ValidationError::new("volume must have a container path"));
    }
    let sources = [&volume.host_path, &volume.image, &volume.source]
        .iter()
        .filter(|source| source.is_some())
        .count();
    if sources != 1 {
        return Err(ValidationError::new(
            "volume must have exactly one of 'host_path', 'image' or 'source' set",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerInfo {
    pub image: String,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub volumes: Vec<Volume>,
    pub docker: Option<DockerInfo>,
}

pub fn validate_container(container: &ContainerInfo) -> ValidationResult {
    for volume in &container.volumes {
        validate_volume(volume)
            .map_err(|e| ValidationError::new(format!("invalid volume: {e}")))?;
    }
    if let Some(docker) = &container.docker {
        // The container name is chosen by the platform; letting tasks pick
        // their own breaks container tracking.
        if docker.parameters.iter().any(|p| p.key == "name") {
            return Err(ValidationError::new(
                "parameter in DockerInfo must not be 'name'",
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckKind {
    Command,
    Http,
    Tcp,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCheck {
    pub port: u16,
    pub path: Option<String>,
    pub scheme: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpCheck {
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub kind: HealthCheckKind,
    pub command: Option<CommandInfo>,
    pub http: Option<HttpCheck>,
    pub tcp: Option<TcpCheck>,
    pub delay_seconds: f64,
    pub interval_seconds: f64,
    pub timeout_seconds: f64,
    pub grace_period_seconds: f64,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            kind: HealthCheckKind::Unknown,
            command: None,
            http: None,
            tcp: None,
            delay_seconds: 0.0,
            interval_seconds: 10.0,
            timeout_seconds: 20.0,
            grace_period_seconds: 10.0,
        }
    }
}

pub fn validate_health_check(check: &HealthCheck) -> ValidationResult {
    match check.kind {
        HealthCheckKind::Command => {
            let Some(command) = &check.command else {
                return Err(ValidationError::new(
                    "expecting 'command' to be set for COMMAND health check",
                ));
            };
            validate_command(command).map_err(|e| {
                ValidationError::new(format!("health check command is invalid: {e}"))
            })?;
        }
        HealthCheckKind::Http => {
            let Some(http) = &check.http else {
                return Err(ValidationError::new(
                    "expecting 'http' to be set for HTTP health check",
                ));
            };
            if let Some(path) = &http.path {
                if !path.starts_with('/') {
                    return Err(ValidationError::new(format!(
                        "the path '{path}' of HTTP health check must start with '/'"
                    )));
                }
            }
            if let Some(scheme) = &http.scheme {
                if scheme != "http" && scheme != "https" {
                    return Err(ValidationError::new(format!(
                        "the scheme '{scheme}' of HTTP health check is not supported"
                    )));
                }
            }
        }
        HealthCheckKind::Tcp => {
            if check.tcp.is_none() {
                return Err(ValidationError::new(
                    "expecting 'tcp' to be set for TCP health check",
                ));
            }
        }
        HealthCheckKind::Unknown => {
            return Err(ValidationError::new("health check must specify a type"));
        }
    }
    if check.delay_seconds < 0.0 {
        return Err(ValidationError::new(
            "expecting 'delay_seconds' to be non-negative",
        ));
    }
    if check.interval_seconds < 0.0 {
        return Err(ValidationError::new(
            "expecting 'interval_seconds' to be non-negative",
        ));
    }
    if check.timeout_seconds < 0.0 {
        return Err(ValidationError::new(
            "expecting 'timeout_seconds' to be non-negative",
        ));
    }
    if check.grace_period_seconds < 0.0 {
        return Err(ValidationError::new(
            "expecting 'grace_period_seconds' to be non-negative",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub name: String,
    pub value: f64,
}

/// Scalar resources are tracked at three-decimal precision.
const SCALAR_PRECISION: f64 = 1000.0;

/// GPUs cannot be fractional: a task either owns a device or it does not.
pub fn validate_gpus(resources: &[Resource]) -> ValidationResult {
    for resource in resources {
        if resource.name != "gpus" {
            continue;
        }
        let scaled = (resource.value * SCALAR_PRECISION).round();
        if resource.value < 0.0 || scaled % SCALAR_PRECISION != 0.0 {
            return Err(ValidationError::new(
                "the 'gpus' resource must be an unsigned integer",
            ));
        }
    }
    Ok(())
}
