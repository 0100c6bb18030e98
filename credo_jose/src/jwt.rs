//! Compact JSON Web Tokens
//!
//! A compact JWT is three base64url sections joined by `.`:
//!
//! ```text
//! eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiJjcmVkbyJ9.<signature>
//! ```
//!
//! The first section is the header, naming the signing algorithm and the key
//! that signed the token. The second is the claim set. Nothing in either
//! section should be trusted until the third section, the signature, has been
//! checked against a known key with [`verify`].

use std::fmt;

use aliri_braid::braid;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use credo_clock::{Clock, DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{error, jwa, jwk, jws, PublicKeys};

/// An audience
#[braid(serde, ref_doc = "A borrowed reference to an [`Audience`]")]
pub struct Audience;

/// An issuer of JWTs
#[braid(serde, ref_doc = "A borrowed reference to an [`Issuer`]")]
pub struct Issuer;

/// The subject of a JWT
#[braid(serde, ref_doc = "A borrowed reference to a [`Subject`]")]
pub struct Subject;

/// A compact JSON Web Token
///
/// Debug and Display output is redacted unless the alternate form (`{:#}`)
/// is requested, in which case the signature is still elided for Debug.
#[braid(
    serde,
    debug = "owned",
    display = "owned",
    ord = "omit",
    ref_doc = "A borrowed reference to a compact JSON Web Token ([`Jwt`])"
)]
#[must_use]
pub struct Jwt;

impl fmt::Debug for JwtRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            match self.0.rfind('.') {
                Some(last_period) => write!(f, "\"{}…\"", &self.0[..=last_period]),
                None => f.write_str("\"…\""),
            }
        } else {
            f.write_str("***JWT***")
        }
    }
}

impl fmt::Display for JwtRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            f.write_str(&self.0)
        } else {
            f.write_str("***JWT***")
        }
    }
}

/// A set of zero or more [`Audience`]s
///
/// Serialized as a bare string when it holds exactly one audience.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OneOrMany<Audience>", into = "OneOrMany<Audience>")]
#[must_use]
pub struct Audiences(Vec<Audience>);

impl Audiences {
    /// An audience set with a single audience
    #[inline]
    pub fn single(aud: impl Into<Audience>) -> Self {
        Self(vec![aud.into()])
    }

    /// Indicates whether the audience set is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|a| a.as_str().is_empty())
    }

    /// Whether `aud` is one of the audiences in the set
    #[must_use]
    pub fn contains(&self, aud: &AudienceRef) -> bool {
        self.0.iter().any(|a| **a == *aud)
    }

    /// Iterates through references to the audiences in the set
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &AudienceRef> {
        self.0.iter().map(AsRef::as_ref)
    }
}

impl From<Audience> for Audiences {
    fn from(aud: Audience) -> Self {
        Self::single(aud)
    }
}

impl From<&str> for Audiences {
    fn from(aud: &str) -> Self {
        Self::single(aud)
    }
}

impl From<Vec<Audience>> for Audiences {
    fn from(vals: Vec<Audience>) -> Self {
        Self(vals)
    }
}

impl From<OneOrMany<Audience>> for Audiences {
    fn from(vals: OneOrMany<Audience>) -> Self {
        match vals {
            OneOrMany::One(x) => Self(vec![x]),
            OneOrMany::Many(v) => Self(v),
        }
    }
}

impl From<Audiences> for OneOrMany<Audience> {
    fn from(mut auds: Audiences) -> Self {
        match auds.0.pop() {
            Some(one) if auds.0.is_empty() => Self::One(one),
            Some(last) => {
                auds.0.push(last);
                Self::Many(auds.0)
            }
            None => Self::Many(Vec::new()),
        }
    }
}

/// A type representing one or more items, primarily for serialization
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single item
    One(T),

    /// Zero or more items, to be serialized/deserialized as an array
    Many(Vec<T>),
}

/// JWT header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct Headers {
    alg: jwa::Algorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<jwk::KeyId>,
}

impl Headers {
    /// The signing algorithm named by the header
    #[must_use]
    pub fn alg(&self) -> jwa::Algorithm {
        self.alg
    }

    /// The key id named by the header, if any
    #[must_use]
    pub fn kid(&self) -> Option<&jwk::KeyIdRef> {
        self.kid.as_deref()
    }
}

/// The claim set carried by a JWT
///
/// `iss`, `sub`, `aud`, `iat`, and `exp` are always present. Any other claims
/// are kept in [`custom`][Claims::custom].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct Claims {
    iss: Issuer,
    sub: Subject,
    aud: Audiences,
    iat: UnixTime,
    exp: UnixTime,
    #[serde(flatten)]
    custom: serde_json::Map<String, serde_json::Value>,
}

const TYPED_CLAIMS: [&str; 5] = ["iss", "sub", "aud", "iat", "exp"];

impl Claims {
    /// Constructs a claim set with no custom claims
    pub fn new(
        iss: impl Into<Issuer>,
        sub: impl Into<Subject>,
        aud: impl Into<Audiences>,
        iat: UnixTime,
        exp: UnixTime,
    ) -> Self {
        Self {
            iss: iss.into(),
            sub: sub.into(),
            aud: aud.into(),
            iat,
            exp,
            custom: serde_json::Map::new(),
        }
    }

    /// Adds a custom claim, replacing any custom claim with the same name
    ///
    /// The registered claims held in typed fields (`iss`, `sub`, `aud`,
    /// `iat`, `exp`) are fixed by [`Claims::new`] and are not replaced here.
    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let name = name.into();
        if TYPED_CLAIMS.contains(&name.as_str()) {
            tracing::warn!(claim = %name, "ignoring custom value for a registered claim");
        } else {
            self.custom.insert(name, value.into());
        }
        self
    }

    /// The `iss` claim
    #[must_use]
    pub fn issuer(&self) -> &IssuerRef {
        &self.iss
    }

    /// The `sub` claim
    #[must_use]
    pub fn subject(&self) -> &SubjectRef {
        &self.sub
    }

    /// The `aud` claim
    pub fn audience(&self) -> &Audiences {
        &self.aud
    }

    /// The `iat` claim
    #[must_use]
    pub fn issued_at(&self) -> UnixTime {
        self.iat
    }

    /// The `exp` claim
    #[must_use]
    pub fn expiry(&self) -> UnixTime {
        self.exp
    }

    /// Claims other than the registered ones above
    #[must_use]
    pub fn custom(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.custom
    }

    /// Looks up a single custom claim
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&serde_json::Value> {
        self.custom.get(name)
    }

    fn check_encodable(&self) -> Result<(), error::EncodeError> {
        if self.iss.as_str().is_empty() {
            return Err(error::EncodeError::InvalidClaims("issuer is empty"));
        }
        if self.sub.as_str().is_empty() {
            return Err(error::EncodeError::InvalidClaims("subject is empty"));
        }
        if self.aud.is_empty() {
            return Err(error::EncodeError::InvalidClaims("audience is empty"));
        }
        if self.iat > self.exp {
            return Err(error::EncodeError::InvalidClaims("issued after expiry"));
        }
        Ok(())
    }
}

/// Builds and signs a compact JWT
///
/// The header names the signer's algorithm and, if given, `key_id`.
///
/// # Errors
///
/// * The claims lack an issuer, subject, or audience, or `iat` is after `exp`
/// * Serialization of the header or payload fails
/// * The signer fails
pub fn encode(
    claims: &Claims,
    signer: &dyn jws::Signer,
    key_id: Option<&jwk::KeyIdRef>,
) -> Result<Jwt, error::EncodeError> {
    claims.check_encodable()?;

    let headers = Headers {
        alg: signer.algorithm(),
        typ: Some("JWT".to_owned()),
        kid: key_id.map(ToOwned::to_owned),
    };

    let mut message = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&headers)?);
    message.push('.');
    URL_SAFE_NO_PAD.encode_string(serde_json::to_vec(claims)?, &mut message);

    let signature = signer.sign(message.as_bytes())?;

    message.push('.');
    URL_SAFE_NO_PAD.encode_string(signature, &mut message);

    Ok(Jwt::new(message))
}

/// A JWT split into its parts, with header and claims decoded but **not verified**
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct Decomposed<'a> {
    header: Headers,
    claims: Claims,
    message: &'a str,
    signature: Vec<u8>,
}

impl<'a> Decomposed<'a> {
    /// The untrusted header of the JWT
    ///
    /// **WARNING:** *This header has not been validated and should not be trusted.*
    pub fn untrusted_header(&self) -> &Headers {
        &self.header
    }

    /// The untrusted claims of the JWT
    ///
    /// **WARNING:** *These claims have not been validated and should not be trusted.*
    /// Use [`verify`] before making any decision based on them.
    pub fn untrusted_claims(&self) -> &Claims {
        &self.claims
    }
}

macro_rules! expect_three {
    ($iter:expr) => {{
        let mut i = $iter;
        match (i.next(), i.next(), i.next(), i.next()) {
            (Some(first), Some(second), Some(third), None) => Some((first, second, third)),
            _ => None,
        }
    }};
}

/// Parses a JWT without checking its signature or claims
///
/// Intended for inspection only, such as reading an ID token's expiry to
/// schedule a refresh. Never use the result for a trust decision.
///
/// # Errors
///
/// The token is not three base64url sections of JSON.
pub fn decode_unverified(token: &JwtRef) -> Result<Decomposed<'_>, error::VerifyError> {
    let (h_str, p_str, s_str) = expect_three!(token.as_str().split('.'))
        .ok_or(error::VerifyError::Malformed("expected three sections"))?;

    let header: Headers = decode_section(h_str, "header")?;
    let claims: Claims = decode_section(p_str, "payload")?;
    let signature = URL_SAFE_NO_PAD
        .decode(s_str)
        .map_err(|_| error::VerifyError::Malformed("signature is not base64url"))?;

    Ok(Decomposed {
        header,
        claims,
        message: &token.as_str()[..h_str.len() + 1 + p_str.len()],
        signature,
    })
}

fn decode_section<T: for<'de> Deserialize<'de>>(
    section: &str,
    name: &'static str,
) -> Result<T, error::VerifyError> {
    let raw = URL_SAFE_NO_PAD.decode(section).map_err(|_| {
        error::VerifyError::Malformed(match name {
            "header" => "header is not base64url",
            _ => "payload is not base64url",
        })
    })?;
    serde_json::from_slice(&raw).map_err(|_| {
        error::VerifyError::Malformed(match name {
            "header" => "header is not a JSON object",
            _ => "payload is not a valid claim set",
        })
    })
}

/// Expectations a token must meet to be accepted by [`verify`]
#[derive(Clone, Debug)]
#[must_use]
pub struct Validation {
    audience: Audience,
    issuer: Option<Issuer>,
    leeway: DurationSecs,
}

impl Validation {
    /// Requires the token to be addressed to `audience`
    ///
    /// The default leeway is 60 seconds on either side of `iat` and `exp`.
    pub fn new(audience: impl Into<Audience>) -> Self {
        Self {
            audience: audience.into(),
            issuer: None,
            leeway: DurationSecs(60),
        }
    }

    /// Requires the token to be issued by `issuer`
    pub fn require_issuer(self, issuer: impl Into<Issuer>) -> Self {
        Self {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    /// Sets the clock skew tolerance applied to `iat` and `exp`
    pub fn with_leeway(self, leeway: DurationSecs) -> Self {
        Self { leeway, ..self }
    }
}

/// The header and claims of a JWT that passed [`verify`]
///
/// This type can _only_ be constructed within this crate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verified {
    headers: Headers,
    claims: Claims,
}

impl Verified {
    /// The verified token headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The verified token claims
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// The id of the key that verified the token
    #[must_use]
    pub fn key_id(&self) -> Option<&jwk::KeyIdRef> {
        self.headers.kid()
    }

    /// Extracts the claims
    pub fn into_claims(self) -> Claims {
        self.claims
    }
}

/// Verifies a JWT's signature and core claims
///
/// The key is located by the header's `kid`; the signature is checked;
/// `exp` and `iat` are checked against `clock` with the validation's leeway;
/// the audience (and issuer, if required) must match exactly.
///
/// # Errors
///
/// Fails closed on the first mismatch, with a [`VerifyError`][error::VerifyError]
/// identifying the cause.
pub fn verify<C: Clock + ?Sized>(
    token: &JwtRef,
    keys: &PublicKeys,
    validation: &Validation,
    clock: &C,
) -> Result<Verified, error::VerifyError> {
    let decomposed = decode_unverified(token)?;

    let kid = decomposed
        .header
        .kid()
        .ok_or(error::VerifyError::MissingKeyId)?;
    let key = keys
        .get(kid)
        .ok_or_else(|| error::VerifyError::UnknownKeyId(kid.as_str().to_owned()))?;

    key.verify(
        decomposed.header.alg(),
        decomposed.message.as_bytes(),
        &decomposed.signature,
    )?;

    let claims = &decomposed.claims;
    let now = clock.now();

    if claims.exp + validation.leeway < now {
        tracing::debug!(exp = claims.exp.0, now = now.0, "rejecting expired token");
        return Err(error::VerifyError::Expired);
    }

    if claims.iat > now + validation.leeway {
        tracing::debug!(iat = claims.iat.0, now = now.0, "rejecting token issued in the future");
        return Err(error::VerifyError::NotYetValid);
    }

    if !claims.aud.contains(&validation.audience) {
        return Err(error::VerifyError::WrongAudience);
    }

    if let Some(issuer) = &validation.issuer {
        if claims.iss != *issuer {
            return Err(error::VerifyError::WrongIssuer);
        }
    }

    Ok(Verified {
        headers: decomposed.header,
        claims: decomposed.claims,
    })
}
