use std::fmt;

use credo_clock::{DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{AccessToken, AccessTokenRef, Principal, PrincipalRef};

/// What a token asserts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// An opaque OAuth2 access token
    Access,
    /// A signed identity assertion (JWT) for a specific audience
    Id,
    /// A static API key
    ApiKey,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Access => "access token",
            Self::Id => "ID token",
            Self::ApiKey => "API key",
        })
    }
}

/// An immutable bearer value with an optional expiry
///
/// A token without an expiry never expires. Refreshing a credential
/// produces a new token rather than altering an existing one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    value: AccessToken,
    kind: TokenKind,
    token_type: String,
    issued_at: UnixTime,
    expiry: Option<UnixTime>,
    principal: Option<Principal>,
}

impl Token {
    /// Constructs a bearer access token
    pub fn access(value: impl Into<AccessToken>, issued_at: UnixTime, expiry: Option<UnixTime>) -> Self {
        Self {
            value: value.into(),
            kind: TokenKind::Access,
            token_type: "Bearer".to_owned(),
            issued_at,
            expiry,
            principal: None,
        }
    }

    /// Constructs an ID token
    pub fn id(value: impl Into<AccessToken>, issued_at: UnixTime, expiry: UnixTime) -> Self {
        Self {
            kind: TokenKind::Id,
            ..Self::access(value, issued_at, Some(expiry))
        }
    }

    /// Constructs a token carrying a static API key, which never expires
    pub fn api_key(value: impl Into<AccessToken>, issued_at: UnixTime) -> Self {
        Self {
            kind: TokenKind::ApiKey,
            ..Self::access(value, issued_at, None)
        }
    }

    /// Constructs an access token valid for `lifetime` from `issued_at`
    pub(crate) fn access_for(
        value: impl Into<AccessToken>,
        issued_at: UnixTime,
        lifetime: DurationSecs,
    ) -> Self {
        Self::access(value, issued_at, Some(issued_at + lifetime))
    }

    /// Records the principal the token was issued for
    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<Principal>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Records the token type reported by the issuer
    #[must_use]
    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    /// The bearer value
    #[inline]
    pub fn value(&self) -> &AccessTokenRef {
        &self.value
    }

    /// What the token asserts
    #[inline]
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// The token type reported by the issuer, usually `Bearer`
    #[inline]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// When the token was obtained
    #[inline]
    pub fn issued_at(&self) -> UnixTime {
        self.issued_at
    }

    /// When the token stops being accepted, if ever
    #[inline]
    pub fn expiry(&self) -> Option<UnixTime> {
        self.expiry
    }

    /// The principal the token was issued for, when known
    #[inline]
    pub fn principal(&self) -> Option<&PrincipalRef> {
        self.principal.as_deref()
    }

    /// Whether the token can still be used at `now`, leaving `skew` to spare
    ///
    /// A token is valid iff `now + skew < expiry`.
    #[inline]
    pub fn is_valid_at(&self, now: UnixTime, skew: DurationSecs) -> bool {
        match self.expiry {
            Some(expiry) => now + skew < expiry,
            None => true,
        }
    }

    /// How long until the token expires, as of `now`
    pub fn remaining_at(&self, now: UnixTime) -> Option<DurationSecs> {
        self.expiry.map(|expiry| if now < expiry { expiry - now } else { DurationSecs::ZERO })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKEW: DurationSecs = DurationSecs(60);

    #[test]
    fn boundary_one_second_inside_skew_is_invalid() {
        let now = UnixTime(1_000);
        let token = Token::access("t", now, Some(now + SKEW - DurationSecs(1)));
        assert!(!token.is_valid_at(now, SKEW));
    }

    #[test]
    fn boundary_one_second_past_skew_is_valid() {
        let now = UnixTime(1_000);
        let token = Token::access("t", now, Some(now + SKEW + DurationSecs(1)));
        assert!(token.is_valid_at(now, SKEW));
    }

    #[test]
    fn expiry_exactly_at_skew_is_invalid() {
        let now = UnixTime(1_000);
        let token = Token::access("t", now, Some(now + SKEW));
        assert!(!token.is_valid_at(now, SKEW));
    }

    #[test]
    fn token_without_expiry_never_expires() {
        let token = Token::api_key("key", UnixTime(0));
        assert!(token.is_valid_at(UnixTime(u64::MAX - 1), SKEW));
        assert_eq!(token.remaining_at(UnixTime(5)), None);
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let token = Token::access_for("t", UnixTime(100), DurationSecs(50));
        assert_eq!(token.remaining_at(UnixTime(120)), Some(DurationSecs(30)));
        assert_eq!(token.remaining_at(UnixTime(500)), Some(DurationSecs::ZERO));
    }

    #[test]
    fn debug_does_not_reveal_value() {
        let token = Token::access("super-secret-value", UnixTime(0), None);
        assert!(!format!("{:?}", token).contains("super-secret-value"));
    }
}
