use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use thiserror::Error;

use crate::models::UserId;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token is missing")]
    Missing,
    #[error("token is invalid: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

#[derive(Deserialize)]
struct Claims {
    sub: UserId,
}

/// Verifies the JWT issued by the account layer and extracts the subject
/// user id. The core treats issuance as an external black box; this is the
/// one place it trusts a signature.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<UserId, TokenError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(data.claims.sub)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use uuid::Uuid;

    #[test]
    fn round_trips_a_valid_token() {
        let verifier = TokenVerifier::new("test-secret");
        let user_id = UserId::from(Uuid::new_v4());
        let token = encode(&Header::default(), &Claims { sub: user_id }, &EncodingKey::from_secret(b"test-secret")).unwrap();

        assert_eq!(verifier.verify(&token).unwrap(), user_id);
    }

    #[test]
    fn rejects_a_token_signed_with_a_different_secret() {
        let verifier = TokenVerifier::new("test-secret");
        let user_id = UserId::from(Uuid::new_v4());
        let token = encode(&Header::default(), &Claims { sub: user_id }, &EncodingKey::from_secret(b"other-secret")).unwrap();

        assert!(verifier.verify(&token).is_err());
    }
}
