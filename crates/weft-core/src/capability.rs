//! Capability validation for task assignment.
//!
//! Matches a task's requirements against a node's capability token and usage
//! snapshot, producing a full violation report. The report is the primary
//! interface; [`CapabilityValidator::validate_and_raise`] is the typed-error
//! form for call sites that want to bail.

use crate::model::{CapabilityToken, NodeUsage, ResourceKind, TaskRequirements};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationErrorCode {
    CapabilityMissing,
    ResourceLimitExceeded,
    DataScopeViolation,
}

/// One resource-limit violation with the numbers that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceViolation {
    pub resource: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
}

/// Full validation outcome. `valid` is true only when every violation class
/// is empty; `error_code` names the first non-empty class in check order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ValidationErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub missing_capabilities: Vec<String>,
    pub resource_violations: Vec<ResourceViolation>,
    pub scope_violations: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("node missing required capabilities: {}", missing.join(", "))]
    CapabilityMissing { missing: Vec<String> },
    #[error("{message}")]
    ResourceLimitExceeded {
        message: String,
        violations: Vec<ResourceViolation>,
    },
    #[error("data scope violation: task requires access to {}", scopes.join(", "))]
    DataScopeViolation { scopes: Vec<String> },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityValidator;

impl CapabilityValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate `token` + `usage` against `requirements`.
    pub fn validate(
        &self,
        requirements: &TaskRequirements,
        token: &CapabilityToken,
        usage: &NodeUsage,
    ) -> ValidationReport {
        let missing_capabilities = self.check_capabilities(requirements, token);
        let resource_violations = self.check_resource_limits(requirements, token, usage);
        let scope_violations = self.check_data_scope(requirements, token);

        let valid = missing_capabilities.is_empty()
            && resource_violations.is_empty()
            && scope_violations.is_empty();

        let (error_code, error_message) = if valid {
            (None, None)
        } else if !missing_capabilities.is_empty() {
            (
                Some(ValidationErrorCode::CapabilityMissing),
                Some(format!(
                    "Node missing required capabilities: {}",
                    missing_capabilities.join(", ")
                )),
            )
        } else if !resource_violations.is_empty() {
            (
                Some(ValidationErrorCode::ResourceLimitExceeded),
                Some(resource_violations[0].message.clone()),
            )
        } else {
            (
                Some(ValidationErrorCode::DataScopeViolation),
                Some(format!(
                    "Data scope violation: task requires access to {}",
                    scope_violations.join(", ")
                )),
            )
        };

        tracing::debug!(
            event = "weft.capability.validated",
            task_id = %requirements.task_id,
            peer_id = %token.peer_id,
            valid,
            "capability validation completed"
        );

        ValidationReport {
            valid,
            error_code,
            error_message,
            missing_capabilities,
            resource_violations,
            scope_violations,
        }
    }

    /// Like [`validate`](Self::validate), but maps the first violation class
    /// to its typed error.
    pub fn validate_and_raise(
        &self,
        requirements: &TaskRequirements,
        token: &CapabilityToken,
        usage: &NodeUsage,
    ) -> Result<(), CapabilityError> {
        let report = self.validate(requirements, token, usage);
        if report.valid {
            return Ok(());
        }

        if !report.missing_capabilities.is_empty() {
            return Err(CapabilityError::CapabilityMissing {
                missing: report.missing_capabilities,
            });
        }
        if !report.resource_violations.is_empty() {
            return Err(CapabilityError::ResourceLimitExceeded {
                message: report
                    .error_message
                    .unwrap_or_else(|| "resource limits exceeded".to_string()),
                violations: report.resource_violations,
            });
        }
        Err(CapabilityError::DataScopeViolation {
            scopes: report.scope_violations,
        })
    }

    fn check_capabilities(
        &self,
        requirements: &TaskRequirements,
        token: &CapabilityToken,
    ) -> Vec<String> {
        requirements
            .required_capabilities
            .iter()
            .filter(|cap| !token.capabilities.contains(*cap))
            .cloned()
            .collect()
    }

    fn check_resource_limits(
        &self,
        requirements: &TaskRequirements,
        token: &CapabilityToken,
        usage: &NodeUsage,
    ) -> Vec<ResourceViolation> {
        let mut violations = Vec::new();

        // Concurrency cap. Absent limit means effectively unbounded.
        if let Some(&max_concurrent) = token.limits.get("max_concurrent_tasks") {
            let current = f64::from(usage.concurrent_tasks);
            if current >= max_concurrent {
                violations.push(ResourceViolation {
                    resource: "concurrent_tasks".to_string(),
                    message: format!(
                        "Node at maximum concurrent tasks ({current}/{max_concurrent})"
                    ),
                    required: None,
                    available: None,
                    limit: Some(max_concurrent),
                    current: Some(current),
                });
            }
        }

        if let Some(required_minutes) = gpu_limit(requirements, "minutes") {
            if let Some(&max_gpu_minutes) = token.limits.get("max_gpu_minutes") {
                let remaining = max_gpu_minutes - usage.gpu_minutes_used;
                if remaining < required_minutes {
                    violations.push(ResourceViolation {
                        resource: "gpu_minutes".to_string(),
                        message: format!(
                            "Insufficient GPU minutes: task requires {required_minutes} minutes, \
                             only {remaining} minutes remaining"
                        ),
                        required: Some(required_minutes),
                        available: Some(remaining),
                        limit: Some(max_gpu_minutes),
                        current: Some(usage.gpu_minutes_used),
                    });
                }
            }
        }

        if let Some(required_mb) = gpu_limit(requirements, "mb") {
            if let Some(&max_gpu_memory) = token.limits.get("max_gpu_memory_mb") {
                if max_gpu_memory < required_mb {
                    violations.push(ResourceViolation {
                        resource: "gpu_memory".to_string(),
                        message: format!(
                            "Insufficient GPU memory: task requires {required_mb}MB, \
                             node has {max_gpu_memory}MB"
                        ),
                        required: Some(required_mb),
                        available: Some(max_gpu_memory),
                        limit: Some(max_gpu_memory),
                        current: None,
                    });
                }
            }
        }

        violations
    }

    fn check_data_scope(
        &self,
        requirements: &TaskRequirements,
        token: &CapabilityToken,
    ) -> Vec<String> {
        let Some(scope) = &requirements.data_scope else {
            return Vec::new();
        };

        if token.data_scopes.contains(&scope.project_id) {
            Vec::new()
        } else {
            vec![scope.project_id.clone()]
        }
    }
}

fn gpu_limit(requirements: &TaskRequirements, unit: &str) -> Option<f64> {
    requirements
        .resource_limits
        .iter()
        .find(|limit| limit.resource == ResourceKind::Gpu && limit.unit.eq_ignore_ascii_case(unit))
        .map(|limit| limit.min_required)
}
