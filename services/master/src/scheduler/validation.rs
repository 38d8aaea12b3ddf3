//! Structural validation of scheduler calls.

use thiserror::Error;

use super::{
    AcknowledgeOperationStatusPayload, AcknowledgePayload, Call, CallBody, CallType, RawCall,
};
use crate::authz::Principal;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Expecting 'type' to be present")]
    MissingType,

    #[error("Expecting '{0}' to be present")]
    MissingField(&'static str),

    #[error("'framework_id' differs from 'subscribe.framework_info.id'")]
    FrameworkIdMismatch,

    #[error("Authenticated principal '{authenticated}' does not match principal '{declared}' set in `FrameworkInfo`")]
    PrincipalMismatch {
        authenticated: String,
        declared: String,
    },

    #[error("Invalid UUID '{0}'")]
    InvalidUuid(String),
}

fn require<T>(field: Option<T>, name: &'static str) -> Result<T, ValidationError> {
    field.ok_or(ValidationError::MissingField(name))
}

fn parse_uuid(value: &str) -> Result<uuid::Uuid, ValidationError> {
    uuid::Uuid::parse_str(value).map_err(|_| ValidationError::InvalidUuid(value.to_string()))
}

fn validate_subscribe(raw: RawCall, principal: Option<&Principal>) -> Result<Call, ValidationError> {
    let subscribe = require(raw.subscribe, "subscribe")?;
    let framework_info = require(subscribe.framework_info, "subscribe.framework_info")?;

    // An unset id on either side only matches an unset id on the other.
    if framework_info.id != raw.framework_id {
        return Err(ValidationError::FrameworkIdMismatch);
    }

    if let (Some(authenticated), Some(declared)) = (
        principal.and_then(Principal::value),
        framework_info.principal.as_deref(),
    ) {
        if authenticated != declared {
            return Err(ValidationError::PrincipalMismatch {
                authenticated: authenticated.to_string(),
                declared: declared.to_string(),
            });
        }
    }

    Ok(Call {
        framework_id: raw.framework_id,
        body: CallBody::Subscribe { framework_info },
    })
}

/// Checks that `raw` carries the payload its type needs and turns it into a
/// typed [`Call`].
pub fn validate(raw: RawCall, principal: Option<&Principal>) -> Result<Call, ValidationError> {
    let call_type = raw.call_type.ok_or(ValidationError::MissingType)?;

    let framework_id = match call_type {
        CallType::Subscribe => return validate_subscribe(raw, principal),
        _ => require(raw.framework_id, "framework_id")?,
    };

    let body = match call_type {
        CallType::Subscribe => return validate_subscribe(raw, principal),
        CallType::Teardown => CallBody::Teardown,
        CallType::Accept => CallBody::Accept(require(raw.accept, "accept")?),
        CallType::Decline => CallBody::Decline(require(raw.decline, "decline")?),
        CallType::AcceptInverseOffers => CallBody::AcceptInverseOffers(require(
            raw.accept_inverse_offers,
            "accept_inverse_offers",
        )?),
        CallType::DeclineInverseOffers => CallBody::DeclineInverseOffers(require(
            raw.decline_inverse_offers,
            "decline_inverse_offers",
        )?),
        CallType::Revive => CallBody::Revive(raw.revive.unwrap_or_default()),
        CallType::Suppress => CallBody::Suppress(raw.suppress.unwrap_or_default()),
        CallType::Kill => CallBody::Kill(require(raw.kill, "kill")?),
        CallType::Shutdown => CallBody::Shutdown(require(raw.shutdown, "shutdown")?),
        CallType::Acknowledge => {
            let AcknowledgePayload {
                agent_id,
                task_id,
                uuid,
            } = require(raw.acknowledge, "acknowledge")?;
            CallBody::Acknowledge {
                agent_id,
                task_id,
                uuid: parse_uuid(&uuid)?,
            }
        }
        CallType::AcknowledgeOperationStatus => {
            let AcknowledgeOperationStatusPayload {
                agent_id,
                resource_provider_id,
                operation_id,
                uuid,
            } = require(raw.acknowledge_operation_status, "acknowledge_operation_status")?;
            let uuid = parse_uuid(&uuid)?;
            CallBody::AcknowledgeOperationStatus {
                agent_id: require(agent_id, "agent_id")?,
                resource_provider_id: require(resource_provider_id, "resource_provider_id")?,
                operation_id,
                uuid,
            }
        }
        CallType::Reconcile => CallBody::Reconcile(require(raw.reconcile, "reconcile")?),
        CallType::ReconcileOperations => CallBody::ReconcileOperations(require(
            raw.reconcile_operations,
            "reconcile_operations",
        )?),
        CallType::Message => CallBody::Message(require(raw.message, "message")?),
        CallType::Request => CallBody::Request(require(raw.request, "request")?),
        CallType::Unknown => CallBody::Unknown,
    };

    Ok(Call {
        framework_id: Some(framework_id),
        body,
    })
}
