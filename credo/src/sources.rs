//! The kinds of credential, and loading them from credential files

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{Context, Credential, CredentialKind, Error};

mod api_key;
pub(crate) mod dto;
mod external_account;
mod id_token;
mod impersonated;
mod metadata;
mod service_account;
mod user_account;

pub use api_key::{ApiKey, API_KEY_HEADER};
pub use external_account::{
    AwsSource, CredentialSource, ExecutableSource, ExternalAccount, ExternalAccountFlavor,
    SubjectTokenFormat, ALLOW_EXECUTABLES_VAR,
};
pub use id_token::{verify_id_token, IdTokenCredential};
pub use impersonated::{Impersonated, DEFAULT_IAM_ENDPOINT, MAX_CHAIN_LENGTH, MAX_LIFETIME};
pub use metadata::{ComputeMetadata, DEFAULT_METADATA_HOST, METADATA_HOST_VAR};
pub use service_account::ServiceAccount;
pub use user_account::{ClientAuth, UserAccount, UserAccountConfig};

/// The scope requested when a credential is given none
pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// The default OAuth2 token endpoint
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

impl Credential {
    /// Loads a credential from the contents of a credential file
    ///
    /// The file's `type` field selects the kind of credential.
    ///
    /// # Errors
    ///
    /// The file is not valid JSON, has an unsupported `type`, or is missing
    /// a field its type requires.
    pub fn from_json(json: &[u8], ctx: &Context) -> Result<Self, Error> {
        let value: Value = serde_json::from_slice(json)
            .map_err(|e| Error::configuration_by("credential file is not valid JSON", e))?;
        from_value(value, ctx)
    }
}

pub(crate) fn from_value(value: Value, ctx: &Context) -> Result<Credential, Error> {
    let (kind, quota_project) = kind_from_value(value, ctx)?;
    let credential = Credential::new(kind, ctx.clone());
    Ok(match quota_project {
        Some(project) => credential.with_quota_project(project),
        None => credential,
    })
}

pub(crate) fn kind_from_value(
    value: Value,
    ctx: &Context,
) -> Result<(CredentialKind, Option<String>), Error> {
    let ty = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::configuration("credential file has no `type` field"))?
        .to_owned();

    tracing::debug!(r#type = %ty, "loading credential from file");

    match ty.as_str() {
        "service_account" => {
            let file: dto::ServiceAccountFile = parse(value, &ty)?;
            let quota = file.quota_project_id.clone();
            Ok((ServiceAccount::from_file(file)?.into(), quota))
        }
        "authorized_user" => {
            let file: dto::AuthorizedUserFile = parse(value, &ty)?;
            let quota = file.quota_project_id.clone();
            Ok((UserAccount::from_file(file)?.into(), quota))
        }
        "external_account_authorized_user" => {
            let file: dto::ExternalAuthorizedUserFile = parse(value, &ty)?;
            let quota = file.quota_project_id.clone();
            Ok((UserAccount::from_external_file(file)?.into(), quota))
        }
        "external_account" => {
            let file: dto::ExternalAccountFile = parse(value, &ty)?;
            let quota = file.quota_project_id.clone();
            Ok((ExternalAccount::from_file(file, ctx)?.into(), quota))
        }
        "impersonated_service_account" => {
            let file: dto::ImpersonatedFile = parse(value, &ty)?;
            let quota = file.quota_project_id.clone();
            Ok((Impersonated::from_file(file, ctx)?.into(), quota))
        }
        other => Err(Error::configuration(format!(
            "unsupported credential type `{other}`"
        ))),
    }
}

fn parse<T: DeserializeOwned>(value: Value, ty: &str) -> Result<T, Error> {
    serde_json::from_value(value)
        .map_err(|e| Error::configuration_by(format!("invalid `{ty}` credential file"), e))
}

pub(crate) fn non_empty(value: &str, field: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        Err(Error::configuration(format!("`{field}` must not be empty")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        test::{self, FakeTransport},
        ErrorKind,
    };

    fn ctx() -> Context {
        test::context(Arc::new(FakeTransport::unreachable())).0
    }

    #[test]
    fn dispatches_on_type() {
        let json = test::service_account_json("https://oauth2.example/token").to_string();
        let credential = Credential::from_json(json.as_bytes(), &ctx()).unwrap();
        assert!(matches!(credential.kind(), CredentialKind::ServiceAccount(_)));

        let json = json!({
            "type": "authorized_user",
            "client_id": "cid",
            "client_secret": "secret",
            "refresh_token": "rt",
            "quota_project_id": "billing-project",
        });
        let credential = Credential::from_json(json.to_string().as_bytes(), &ctx()).unwrap();
        assert!(matches!(credential.kind(), CredentialKind::UserAccount(_)));
        assert_eq!(credential.quota_project(), Some("billing-project"));
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let err = Credential::from_json(br#"{"type": "gdch_service_account"}"#, &ctx()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("unsupported credential type"));
    }

    #[test]
    fn missing_type_is_configuration_error() {
        let err = Credential::from_json(br#"{"client_email": "a@b"}"#, &ctx()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn missing_required_field_fails_at_construction() {
        let err = Credential::from_json(
            br#"{"type": "authorized_user", "client_id": "cid", "client_secret": "s"}"#,
            &ctx(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn invalid_json_is_configuration_error() {
        let err = Credential::from_json(b"{not json", &ctx()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
