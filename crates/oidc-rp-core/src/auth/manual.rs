use std::future::Future;

use url::Url;

use super::{AuthError, Session, SessionManager};

/// Copy/paste login: the user pastes the redirect URL (or its query string) back.
///
/// A bare authorization code is rejected because it cannot be bound to the
/// pending request's `state`.
pub async fn run_manual_login<Notify, Input, Fut>(
    manager: &SessionManager,
    open_browser: bool,
    notify_authorization_url: Notify,
    mut read_input: Input,
) -> Result<Session, AuthError>
where
    Notify: Fn(&Url) -> Result<(), AuthError>,
    Input: FnMut() -> Fut,
    Fut: Future<Output = Result<String, AuthError>>,
{
    let auth_url = manager.login().await?;
    notify_authorization_url(&auth_url)?;

    if open_browser {
        open::that(auth_url.as_str()).map_err(|err| AuthError::BrowserLaunch(err.to_string()))?;
    }

    let raw = read_input().await?;
    manager.handle_callback(raw.trim()).await
}
