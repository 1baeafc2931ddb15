//! Connection identity
//!
//! Identity is established out of band: clients arrive with a signed token
//! naming who they are and what role the issuer gave them. The first frame on
//! every WebSocket must be an `authenticate` carrying one of these.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use lectern_protocol::Role;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: Uuid,
    /// Display name
    pub name: String,
    pub role: Role,
    pub exp: usize,
}

pub fn create_token(
    user_id: Uuid,
    name: &str,
    role: Role,
    secret: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id,
        name: name.to_string(),
        role,
        exp: (Utc::now() + chrono::Duration::hours(12)).timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}
