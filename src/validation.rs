use crate::error::ServiceError;
use crate::protocol::ChatMessage;

/// Rejects a requested generation length above the server-side ceiling.
pub fn enforce_limit(
    field: &'static str,
    requested: usize,
    limit: usize,
) -> Result<(), ServiceError> {
    if requested > limit {
        return Err(ServiceError::ValidationFailed { field, limit });
    }
    Ok(())
}

pub fn require_messages(messages: &[ChatMessage]) -> Result<(), ServiceError> {
    if messages.is_empty() {
        return Err(ServiceError::MalformedInput(
            "messages must contain at least one entry".into(),
        ));
    }
    Ok(())
}

pub fn check_temperature(temperature: f64) -> Result<(), ServiceError> {
    if !temperature.is_finite() || temperature < 0.0 {
        return Err(ServiceError::MalformedInput(
            "temperature must be a non-negative number".into(),
        ));
    }
    Ok(())
}
