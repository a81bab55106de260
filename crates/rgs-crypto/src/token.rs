use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rgs_core::ActorType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Clock-skew leeway applied to `exp`/`iat` checks (§4.C).
const CLOCK_SKEW_LEEWAY_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token has no kid in its header")]
    MissingKid,
    #[error("kid {0} is not a known signing key")]
    UnknownKid(String),
    #[error("token is malformed or its signature does not verify: {0}")]
    Invalid(String),
}

/// HS256 JWT-shaped claims (§4.C): `sub` is the actor id, `actor_type`
/// distinguishes player/operator/service, `iat`/`exp` are Unix seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub actor_type: ActorType,
    pub iat: i64,
    pub exp: i64,
}

/// Mint a token for `claims`, signed with `secret` and tagged with `kid`.
pub fn mint_token(kid: &str, secret: &[u8], claims: &Claims) -> Result<String, TokenError> {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());
    encode(&header, claims, &EncodingKey::from_secret(secret))
        .map_err(|e| TokenError::Invalid(e.to_string()))
}

/// Verify `token` against whichever key `key_lookup` returns for the
/// token's `kid`. Every present `kid` in the keyset is acceptable for
/// verification, even if it is not the currently-active signing key
/// (§4.C: "all present `kid`s are accepted for verification").
pub fn verify_token(
    token: &str,
    key_lookup: impl Fn(&str) -> Option<Vec<u8>>,
) -> Result<Claims, TokenError> {
    let header = decode_header(token).map_err(|e| TokenError::Invalid(e.to_string()))?;
    let kid = header.kid.ok_or(TokenError::MissingKid)?;
    let secret = key_lookup(&kid).ok_or_else(|| TokenError::UnknownKid(kid.clone()))?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = CLOCK_SKEW_LEEWAY_SECS;
    validation.validate_exp = true;
    validation.set_required_spec_claims(&["exp"]);

    let data = decode::<Claims>(token, &DecodingKey::from_secret(&secret), &validation)
        .map_err(|e| TokenError::Invalid(e.to_string()))?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn keyset() -> HashMap<String, Vec<u8>> {
        HashMap::from([
            ("kid-1".to_string(), b"secret-one".to_vec()),
            ("kid-2".to_string(), b"secret-two".to_vec()),
        ])
    }

    #[test]
    fn mint_and_verify_round_trip() {
        let keys = keyset();
        let claims = Claims {
            sub: "player-1".to_string(),
            actor_type: ActorType::Player,
            iat: 1_700_000_000,
            exp: 1_700_003_600,
        };
        let token = mint_token("kid-1", &keys["kid-1"], &claims).unwrap();
        let verified = verify_token(&token, |kid| keys.get(kid).cloned()).unwrap();
        assert_eq!(verified.sub, "player-1");
    }

    #[test]
    fn unknown_kid_is_rejected() {
        let keys = keyset();
        let claims = Claims {
            sub: "p".to_string(),
            actor_type: ActorType::Player,
            iat: 0,
            exp: 4_000_000_000,
        };
        let token = mint_token("kid-stale", b"some-retired-key", &claims).unwrap();
        assert!(verify_token(&token, |kid| keys.get(kid).cloned()).is_err());
    }

    #[test]
    fn wrong_secret_for_kid_is_rejected() {
        let claims = Claims {
            sub: "p".to_string(),
            actor_type: ActorType::Operator,
            iat: 0,
            exp: 4_000_000_000,
        };
        let token = mint_token("kid-1", b"real-secret", &claims).unwrap();
        let mut keys = HashMap::new();
        keys.insert("kid-1".to_string(), b"wrong-secret".to_vec());
        assert!(verify_token(&token, |kid| keys.get(kid).cloned()).is_err());
    }
}
