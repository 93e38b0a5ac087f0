//! # Principals
//!
//! Typed identity references. A [`Principal`] is declared without knowing the
//! target account; [`Principal::resolve`] turns it into a concrete identifier
//! for a given [`Environment`], failing with `InvalidPrincipal` instead of
//! producing a malformed ARN.

use super::Environment;
use crate::error::{ProvisionError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static IAM_ARN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^arn:aws[a-z-]*:iam::\d{12}:(root|user/[\w+=,.@/-]+|role/[\w+=,.@/-]+)$")
        .expect("IAM ARN regex is valid")
});

static IAM_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w+=,.@-]{1,64}$").expect("IAM name regex is valid"));

static SERVICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9-]+(\.[a-z0-9-]+)*\.amazonaws\.com$").expect("service regex is valid")
});

/// Kind of identity behind a principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrincipalKind {
    User,
    Role,
    Service,
    Account,
}

/// An identity that can be granted key access or catalog permissions
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Principal {
    /// Fully qualified IAM ARN
    Arn { arn: String },
    /// IAM user in the target account
    User { name: String },
    /// IAM role in the target account
    Role { name: String },
    /// Service-linked role of an AWS service
    ServiceLinkedRole { service: String, role_name: String },
    /// Role the control plane deploys with
    ExecutionRole,
    /// AWS service principal such as `cloudtrail.amazonaws.com`
    Service { service: String },
    /// Root of the target account
    AccountRoot,
}

/// A principal resolved against an environment
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResolvedPrincipal {
    pub kind: PrincipalKind,
    /// ARN for IAM identities, service name for service principals
    pub identifier: String,
}

impl ResolvedPrincipal {
    /// ARN of the identity; service principals have none
    pub fn arn(&self) -> Result<&str> {
        if self.kind == PrincipalKind::Service {
            return Err(ProvisionError::InvalidPrincipal {
                principal: self.identifier.clone(),
                reason: "service principals have no ARN".to_string(),
            });
        }
        Ok(&self.identifier)
    }

    /// Principal block as used in key and bucket policies
    #[must_use]
    pub fn policy_principal(&self) -> serde_json::Value {
        if self.kind == PrincipalKind::Service {
            serde_json::json!({ "Service": self.identifier })
        } else {
            serde_json::json!({ "AWS": self.identifier })
        }
    }
}

impl Principal {
    #[must_use]
    pub fn arn(arn: impl Into<String>) -> Self {
        Principal::Arn { arn: arn.into() }
    }

    #[must_use]
    pub fn user(name: impl Into<String>) -> Self {
        Principal::User { name: name.into() }
    }

    #[must_use]
    pub fn role(name: impl Into<String>) -> Self {
        Principal::Role { name: name.into() }
    }

    #[must_use]
    pub fn service(service: impl Into<String>) -> Self {
        Principal::Service {
            service: service.into(),
        }
    }

    /// Lake Formation's data-access service-linked role
    #[must_use]
    pub fn lake_formation_service_role() -> Self {
        Principal::ServiceLinkedRole {
            service: "lakeformation.amazonaws.com".to_string(),
            role_name: "AWSServiceRoleForLakeFormationDataAccess".to_string(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> PrincipalKind {
        match self {
            Principal::Arn { arn } if arn.contains(":user/") => PrincipalKind::User,
            Principal::Arn { arn } if arn.ends_with(":root") => PrincipalKind::Account,
            Principal::Arn { .. }
            | Principal::Role { .. }
            | Principal::ServiceLinkedRole { .. }
            | Principal::ExecutionRole => PrincipalKind::Role,
            Principal::User { .. } => PrincipalKind::User,
            Principal::Service { .. } => PrincipalKind::Service,
            Principal::AccountRoot => PrincipalKind::Account,
        }
    }

    /// Resolve to a concrete identifier in `env`
    ///
    /// Pure: the same principal and environment always yield the same result.
    pub fn resolve(&self, env: &Environment) -> Result<ResolvedPrincipal> {
        let identifier = match self {
            Principal::Arn { arn } => {
                if !IAM_ARN.is_match(arn) {
                    return Err(self.invalid("not a well-formed IAM user, role or root ARN"));
                }
                arn.clone()
            }
            Principal::User { name } => {
                self.check_name(name)?;
                env.iam_arn(&format!("user/{name}"))
            }
            Principal::Role { name } => {
                self.check_name(name)?;
                env.iam_arn(&format!("role/{name}"))
            }
            Principal::ServiceLinkedRole { service, role_name } => {
                if !SERVICE.is_match(service) {
                    return Err(self.invalid("service-linked role needs a service name"));
                }
                self.check_name(role_name)?;
                env.iam_arn(&format!("role/aws-service-role/{service}/{role_name}"))
            }
            Principal::ExecutionRole => match &env.execution_role_arn {
                Some(arn) if IAM_ARN.is_match(arn) => arn.clone(),
                Some(_) => return Err(self.invalid("execution role ARN is malformed")),
                None => return Err(self.invalid("no execution role configured for the environment")),
            },
            Principal::Service { service } => {
                if !SERVICE.is_match(service) {
                    return Err(self.invalid("service principal must end in .amazonaws.com"));
                }
                service.clone()
            }
            Principal::AccountRoot => env.iam_arn("root"),
        };

        Ok(ResolvedPrincipal {
            kind: self.kind(),
            identifier,
        })
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if IAM_NAME.is_match(name) {
            Ok(())
        } else {
            Err(self.invalid("IAM names are 1-64 characters of [A-Za-z0-9+=,.@_-]"))
        }
    }

    fn invalid(&self, reason: &str) -> ProvisionError {
        ProvisionError::InvalidPrincipal {
            principal: self.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Arn { arn } => write!(f, "{arn}"),
            Principal::User { name } => write!(f, "user/{name}"),
            Principal::Role { name } => write!(f, "role/{name}"),
            Principal::ServiceLinkedRole { service, role_name } => {
                write!(f, "role/aws-service-role/{service}/{role_name}")
            }
            Principal::ExecutionRole => write!(f, "execution-role"),
            Principal::Service { service } => write!(f, "{service}"),
            Principal::AccountRoot => write!(f, "root"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment::new("123456789012", "aws", "us-east-1").unwrap()
    }

    #[test]
    fn resolves_account_scoped_identities() {
        let user = Principal::user("rodrigo").resolve(&env()).unwrap();
        assert_eq!(user.identifier, "arn:aws:iam::123456789012:user/rodrigo");
        assert_eq!(user.kind, PrincipalKind::User);

        let lf = Principal::lake_formation_service_role().resolve(&env()).unwrap();
        assert_eq!(
            lf.identifier,
            "arn:aws:iam::123456789012:role/aws-service-role/lakeformation.amazonaws.com/AWSServiceRoleForLakeFormationDataAccess"
        );
    }

    #[test]
    fn execution_role_requires_configuration() {
        let err = Principal::ExecutionRole.resolve(&env()).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidPrincipal { .. }));

        let configured = env().with_execution_role("arn:aws:iam::123456789012:role/deployer");
        let resolved = Principal::ExecutionRole.resolve(&configured).unwrap();
        assert_eq!(resolved.identifier, "arn:aws:iam::123456789012:role/deployer");
    }

    #[test]
    fn malformed_arns_are_rejected() {
        for arn in ["", "arn:aws:s3:::bucket", "arn:aws:iam::123:user/x", "rodrigo"] {
            assert!(
                Principal::arn(arn).resolve(&env()).is_err(),
                "'{arn}' should be rejected"
            );
        }
    }

    #[test]
    fn service_principals_have_no_arn() {
        let svc = Principal::service("cloudtrail.amazonaws.com")
            .resolve(&env())
            .unwrap();
        assert!(svc.arn().is_err());
        assert_eq!(
            svc.policy_principal(),
            serde_json::json!({ "Service": "cloudtrail.amazonaws.com" })
        );
        assert!(Principal::service("cloudtrail").resolve(&env()).is_err());
    }
}
