use reqwest::Url;

use crate::error::CoreError;

/// Validated endpoint with any URL-embedded credentials split out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Endpoint {
    pub(super) url: Url,
    pub(super) auth: Option<(String, String)>,
}

/// Parse an `http(s)://[user:pass@]host:port[/path]` connection string.
///
/// Credentials are removed from the URL so they never appear in logs and
/// are sent as a basic-auth header instead.
pub(super) fn parse_connection(connection: &str) -> Result<Endpoint, CoreError> {
    let mut url = Url::parse(connection).map_err(|e| {
        CoreError::Config(format!(
            "invalid connection `{connection}`: expected HTTP(S) URL ({e})"
        ))
    })?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CoreError::Config(format!(
                "unsupported connection scheme `{other}`; expected http or https"
            )));
        }
    }

    let auth = match (url.username(), url.password()) {
        ("", None) => None,
        (user, pass) => Some((user.to_owned(), pass.unwrap_or_default().to_owned())),
    };
    if auth.is_some() {
        // Only fails for cannot-be-a-base URLs, which http(s) never are.
        let stripped = url.set_username("").is_ok() && url.set_password(None).is_ok();
        if !stripped {
            return Err(CoreError::Config(format!(
                "cannot strip credentials from `{}`",
                url.host_str().unwrap_or_default()
            )));
        }
    }

    Ok(Endpoint { url, auth })
}
