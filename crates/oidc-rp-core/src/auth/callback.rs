use url::Url;

use super::AuthError;

/// Parameters delivered to the redirect URI by the authorization endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub session_state: Option<String>,
    pub iss: Option<String>,
}

impl CallbackParams {
    /// Accept a full redirect URL, a request path (`/callback?...`), or a bare query string.
    pub fn parse(input: &str) -> Result<Self, AuthError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AuthError::InvalidAuthorizationResponse("empty input".into()));
        }

        if let Ok(url) = Url::parse(input) {
            return Ok(Self::from_url(&url));
        }

        let query = match input.split_once('?') {
            Some((_, query)) => query,
            None => input,
        };
        let query = query.split('#').next().unwrap_or_default();
        if !query.contains('=') {
            return Err(AuthError::InvalidAuthorizationResponse(
                "no query parameters found".into(),
            ));
        }
        Ok(Self::from_pairs(url::form_urlencoded::parse(query.as_bytes())))
    }

    pub fn from_url(url: &Url) -> Self {
        Self::from_pairs(url.query_pairs())
    }

    fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
    {
        let mut params = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                "session_state" => &mut params.session_state,
                "iss" => &mut params.iss,
                _ => continue,
            };
            *slot = Some(value.into_owned());
        }
        params
    }

    /// The provider's `error=` response, if any.
    pub fn provider_error(&self) -> Option<AuthError> {
        self.error.as_ref().map(|error| AuthError::Provider {
            error: error.clone(),
            description: self.error_description.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_url() {
        let params =
            CallbackParams::parse("https://app.example/callback?code=abc&state=xyz&session_state=s1")
                .unwrap();
        assert_eq!(params.code.as_deref(), Some("abc"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert_eq!(params.session_state.as_deref(), Some("s1"));
    }

    #[test]
    fn parse_request_path() {
        let params = CallbackParams::parse("/callback?code=a%2Fb&state=xyz").unwrap();
        assert_eq!(params.code.as_deref(), Some("a/b"));
    }

    #[test]
    fn parse_bare_query() {
        let params = CallbackParams::parse("?code=abc&state=xyz").unwrap();
        assert_eq!(params.state.as_deref(), Some("xyz"));
        let params = CallbackParams::parse("code=abc&state=xyz").unwrap();
        assert_eq!(params.code.as_deref(), Some("abc"));
    }

    #[test]
    fn parse_provider_error() {
        let params = CallbackParams::parse(
            "https://app.example/callback?error=access_denied&error_description=user+said+no",
        )
        .unwrap();
        match params.provider_error() {
            Some(AuthError::Provider { error, description }) => {
                assert_eq!(error, "access_denied");
                assert_eq!(description.as_deref(), Some("user said no"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(CallbackParams::parse("").is_err());
        assert!(CallbackParams::parse("raw-code").is_err());
    }
}
