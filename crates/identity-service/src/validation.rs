//! Shape checks for `POST /identify` bodies, applied before the engine runs.

use std::sync::Arc;

use identity_core::{Fragment, IdentityError};
use regex_lite::Regex;
use serde_json::Value;

/// Dot-atom local part, `@`, then two or more DNS labels that neither start nor end
/// with `-`. Matched against the already lower-cased address.
const EMAIL_PATTERN: &str = r"^[a-z0-9!#$%&'*+/=?^_`{|}~-]+(\.[a-z0-9!#$%&'*+/=?^_`{|}~-]+)*@[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)+$";

#[derive(Debug, Clone)]
pub(crate) struct RequestValidator {
    email: Arc<Regex>,
}

impl RequestValidator {
    pub(crate) fn new() -> Result<Self, regex_lite::Error> {
        Ok(Self { email: Arc::new(Regex::new(EMAIL_PATTERN)?) })
    }

    /// Turn a raw JSON body into a normalized fragment or a client-facing message.
    pub(crate) fn fragment(&self, body: &Value) -> Result<Fragment, String> {
        let Value::Object(fields) = body else {
            return Err("request body must be a JSON object".to_string());
        };

        let email = match fields.get("email") {
            None | Some(Value::Null) => None,
            Some(Value::String(email)) => Some(email.clone()),
            Some(_) => return Err("email must be a string".to_string()),
        };
        let phone_number = match fields.get("phoneNumber") {
            None | Some(Value::Null) => None,
            Some(Value::String(phone_number)) => Some(phone_number.clone()),
            Some(Value::Number(phone_number)) => Some(phone_number.to_string()),
            Some(_) => return Err("phoneNumber must be a string or number".to_string()),
        };

        let fragment = Fragment::normalize(email.as_deref(), phone_number.as_deref())
            .map_err(|err| match err {
                IdentityError::Validation(message) => message,
                other => other.to_string(),
            })?;

        if let Some(email) = fragment.email() {
            if !self.email.is_match(email) {
                return Err("email format is invalid".to_string());
            }
        }
        Ok(fragment)
    }
}
