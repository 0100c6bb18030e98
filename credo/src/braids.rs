use std::fmt;

use aliri_braid::braid;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// An OAuth2 client ID
#[braid(serde)]
pub struct ClientId;

/// An OAuth2 client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

limited_reveal!(ClientSecretRef: "CLIENT SECRET", 5);

/// A bearer value: an access token or a signed identity token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// A refresh token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

limited_reveal!(RefreshTokenRef: "REFRESH TOKEN", 5);

/// A static API key
#[braid(serde, debug = "owned", display = "owned")]
pub struct ApiKeyValue;

limited_reveal!(ApiKeyValueRef: "API KEY", 5);

/// The identity of a principal, such as a service account email
#[braid(serde)]
pub struct Principal;

/// A token obtained from an external identity provider, traded at a
/// security token service
#[braid(serde, debug = "owned", display = "owned")]
pub struct SubjectToken;

limited_reveal!(SubjectTokenRef: "SUBJECT TOKEN", 5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_hidden_by_default() {
        let token = AccessToken::from_static("ya29.a-very-long-access-token");
        assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
    }

    #[test]
    fn alternate_reveals_a_prefix() {
        let token = AccessToken::from_static("ya29.a-very-long-access-token");
        assert_eq!(format!("{:#?}", token), "\"ya29.a-very-lo…\"");
        assert_eq!(format!("{:#7}", token), "ya29.a…");
        assert_eq!(format!("{:#}", token), "ya29.a-very-long-access-token");
    }

    #[test]
    fn short_secrets_are_revealed_whole_when_alternate() {
        let key = ApiKeyValue::from_static("abc");
        assert_eq!(format!("{:#?}", key), "\"abc\"");
    }

    #[test]
    fn principals_are_not_secret() {
        let p = Principal::from_static("sa@project.iam.gserviceaccount.com");
        assert_eq!(p.to_string(), "sa@project.iam.gserviceaccount.com");
    }
}
