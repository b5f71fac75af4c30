//! Incoming identify requests and their normalization into a [`ContactKey`].

use serde::{Deserialize, Serialize};

use crate::config::ServiceConfig;
use crate::error::ValidationError;
use crate::resolver::ContactKey;

/// A phone number as clients send it: some send a string, some a bare number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhoneNumber {
    Text(String),
    Number(serde_json::Number),
}

impl PhoneNumber {
    /// Canonical string form. Numbers must be non-negative integers.
    pub fn normalize(&self) -> Result<String, ValidationError> {
        match self {
            Self::Text(s) => Ok(s.clone()),
            Self::Number(n) => n.as_u64().map(|v| v.to_string()).ok_or_else(|| {
                ValidationError::InvalidPhoneNumber {
                    reason: format!("{n} is not a non-negative integer"),
                }
            }),
        }
    }
}

impl From<&str> for PhoneNumber {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<u64> for PhoneNumber {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

/// `{ "email"?: string, "phoneNumber"?: string | number }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentifyRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(
        default,
        rename = "phoneNumber",
        skip_serializing_if = "Option::is_none"
    )]
    pub phone_number: Option<PhoneNumber>,
}

impl IdentifyRequest {
    /// Convenience constructor used by tests and embedders.
    #[must_use]
    pub fn new(email: Option<&str>, phone_number: Option<impl Into<PhoneNumber>>) -> Self {
        Self {
            email: email.map(String::from),
            phone_number: phone_number.map(Into::into),
        }
    }

    /// Validate and normalize into a key for the resolver.
    ///
    /// Empty strings count as absent.
    ///
    /// # Errors
    /// - `MissingIdentifier` when neither value remains
    /// - `FieldTooLong` when a value exceeds `config.max_field_len`
    /// - `InvalidPhoneNumber` for negative or fractional numeric phones
    pub fn into_key(self, config: &ServiceConfig) -> Result<ContactKey, ValidationError> {
        let phone_number = self
            .phone_number
            .as_ref()
            .map(PhoneNumber::normalize)
            .transpose()?;

        check_len("email", self.email.as_deref(), config.max_field_len)?;
        check_len("phoneNumber", phone_number.as_deref(), config.max_field_len)?;

        ContactKey::new(self.email, phone_number)
    }
}

fn check_len(
    field: &'static str,
    value: Option<&str>,
    max_length: usize,
) -> Result<(), ValidationError> {
    match value {
        Some(v) if v.len() > max_length => Err(ValidationError::FieldTooLong { field, max_length }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> IdentifyRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_numeric_phone_is_stringified() {
        let key = parse(r#"{"phoneNumber": 123456}"#)
            .into_key(&ServiceConfig::default())
            .unwrap();
        assert_eq!(key.phone_number(), Some("123456"));
        assert_eq!(key.email(), None);
    }

    #[test]
    fn test_string_phone_is_kept_verbatim() {
        let key = parse(r#"{"email": "doc@hillvalley.edu", "phoneNumber": "+1 555"}"#)
            .into_key(&ServiceConfig::default())
            .unwrap();
        assert_eq!(key.phone_number(), Some("+1 555"));
        assert!(key.is_complete());
    }

    #[test]
    fn test_empty_and_null_values_are_missing() {
        for body in [
            r#"{}"#,
            r#"{"email": null, "phoneNumber": null}"#,
            r#"{"email": "", "phoneNumber": ""}"#,
        ] {
            let err = parse(body).into_key(&ServiceConfig::default()).unwrap_err();
            assert_eq!(err, ValidationError::MissingIdentifier, "body: {body}");
        }
    }

    #[test]
    fn test_fractional_or_negative_phone_is_rejected() {
        for body in [r#"{"phoneNumber": 1.5}"#, r#"{"phoneNumber": -7}"#] {
            let err = parse(body).into_key(&ServiceConfig::default()).unwrap_err();
            assert!(
                matches!(err, ValidationError::InvalidPhoneNumber { .. }),
                "body: {body}"
            );
        }
    }

    #[test]
    fn test_oversized_email_is_rejected() {
        let config = ServiceConfig { max_field_len: 8 };
        let err = IdentifyRequest::new(Some("marty@hillvalley.edu"), None::<&str>)
            .into_key(&config)
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::FieldTooLong {
                field: "email",
                max_length: 8
            }
        );
    }

    #[test]
    fn test_wrong_phone_type_fails_to_parse() {
        assert!(serde_json::from_str::<IdentifyRequest>(r#"{"phoneNumber": true}"#).is_err());
    }
}
