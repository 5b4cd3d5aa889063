//! Request bodies with garde validation for the REST API.

use garde::Validate;
use serde::Deserialize;

use crate::error::ChatError;
use crate::model::MAX_USER_ID_LENGTH;
use crate::store::MAX_MESSAGE_LENGTH;

/// Content is measured the way the store keeps it: trimmed, in characters
fn validate_content(value: &str, _ctx: &()) -> garde::Result {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(garde::Error::new("Content cannot be blank"));
    }
    if trimmed.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(garde::Error::new(format!(
            "Content must be at most {} characters",
            MAX_MESSAGE_LENGTH
        )));
    }
    Ok(())
}

/// Input for persisting a chat message
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
#[serde(rename_all = "camelCase")]
pub struct SendMessageInput {
    #[garde(length(chars, min = 1, max = MAX_USER_ID_LENGTH))]
    #[serde(default)]
    pub receiver_id: String,
    #[garde(custom(validate_content))]
    #[serde(default)]
    pub content: String,
}

/// Helper trait to convert garde validation errors into a [`ChatError`]
pub trait ValidateExt {
    fn validate_input(&self) -> Result<(), ChatError>;
}

impl<T: Validate<Context = ()>> ValidateExt for T {
    fn validate_input(&self) -> Result<(), ChatError> {
        self.validate().map_err(|e| ChatError::Validation(e.to_string()))
    }
}
