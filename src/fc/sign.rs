//! Request signing for the Function Compute API.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::FcError;

type HmacSha256 = Hmac<Sha256>;

/// RFC 7231 date format expected in the `date` header.
pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

const SIGNED_HEADER_PREFIX: &str = "x-fc-";

/// Parts of a request covered by the signature.
#[derive(Clone, Copy, Debug)]
pub struct SigningInput<'a> {
    /// HTTP method in upper case.
    pub method: &'a str,
    /// Value of the `content-md5` header, empty when absent.
    pub content_md5: &'a str,
    /// Value of the `content-type` header.
    pub content_type: &'a str,
    /// Value of the `date` header.
    pub date: &'a str,
    /// Request headers; only `x-fc-*` ones are signed.
    pub headers: &'a [(&'a str, &'a str)],
    /// Request path, without the query string for API calls.
    pub resource: &'a str,
}

/// Formats `now` for the `date` header.
#[must_use]
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format(DATE_FORMAT).to_string()
}

/// Builds the canonical string the signature is computed over.
#[must_use]
pub fn string_to_sign(input: &SigningInput<'_>) -> String {
    let mut signed: Vec<(String, &str)> = input
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
        .filter(|(name, _)| name.starts_with(SIGNED_HEADER_PREFIX))
        .collect();
    signed.sort_unstable();
    let canonical: String = signed
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    format!(
        "{}\n{}\n{}\n{}\n{canonical}{}",
        input.method, input.content_md5, input.content_type, input.date, input.resource
    )
}

/// Computes the `Authorization` header value.
///
/// # Errors
///
/// Returns [`FcError::Signing`] when the HMAC cannot be keyed.
pub fn authorization(
    access_key_id: &str,
    access_key_secret: &str,
    input: &SigningInput<'_>,
) -> Result<String, FcError> {
    let signature = sign(access_key_secret, &string_to_sign(input))?;
    Ok(format!("FC {access_key_id}:{signature}"))
}

fn sign(secret: &str, payload: &str) -> Result<String, FcError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|err| FcError::Signing {
        message: err.to_string(),
    })?;
    mac.update(payload.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn input<'a>(headers: &'a [(&'a str, &'a str)]) -> SigningInput<'a> {
        SigningInput {
            method: "POST",
            content_md5: "",
            content_type: "application/json",
            date: "Wed, 01 Jan 2025 00:00:00 GMT",
            headers,
            resource: "/2016-08-15/services",
        }
    }

    #[test]
    fn hmac_matches_the_reference_vector() {
        let signature = sign("Jefe", "what do ya want for nothing?").expect("sign");
        assert_eq!(signature, "W9zBRr9gdU5qBCQmCJV1x1oAPwidJzmDnexYuWTsOEM=");
    }

    #[test]
    fn only_fc_headers_are_signed_in_lowercase_order() {
        let headers = [
            ("X-Fc-Trace", " t "),
            ("content-length", "10"),
            ("x-fc-account-id", "1234"),
        ];

        let canonical = string_to_sign(&input(&headers));

        assert_eq!(
            canonical,
            "POST\n\napplication/json\nWed, 01 Jan 2025 00:00:00 GMT\nx-fc-account-id:1234\nx-fc-trace:t\n/2016-08-15/services"
        );
    }

    #[test]
    fn authorization_header_carries_key_and_signature() {
        let headers = [("x-fc-account-id", "1234")];

        let header = authorization("ak", "secret", &input(&headers)).expect("authorization");

        assert_eq!(header, "FC ak:A4xQWF7fnLLUYXUFYp5wAGkFWpLQzZRSR80x6k3rV2E=");
    }

    #[test]
    fn dates_use_the_http_format() {
        let now = Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .expect("valid date");
        assert_eq!(http_date(now), "Wed, 01 Jan 2025 00:00:00 GMT");
    }
}
