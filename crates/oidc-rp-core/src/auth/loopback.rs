use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use crate::config::ConfigError;

use super::{AuthError, CallbackParams, Session, SessionManager};

const SUCCESS_HTML: &str = r#"<html><body><h1>Sign-in complete</h1><p>You may close this window and return to the terminal.</p></body></html>"#;
const ERROR_HTML: &str = r#"<html><body><h1>Sign-in failed</h1><p>Please return to the terminal for details.</p></body></html>"#;
const NOT_FOUND_HTML: &str = r#"<html><body><h1>Not found</h1></body></html>"#;

/// Loopback HTTP listener that receives one authorization redirect.
#[derive(Debug)]
pub struct LoopbackListener {
    listener: TcpListener,
    redirect_uri: Url,
}

impl LoopbackListener {
    /// Bind `127.0.0.1:port` (0 picks a free port) and serve `path`.
    pub async fn bind(port: u16, path: &str) -> Result<Self, AuthError> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let path = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };
        let redirect_uri = Url::parse(&format!("http://127.0.0.1:{port}{path}"))?;
        debug!(%redirect_uri, "loopback listener bound");
        Ok(Self {
            listener,
            redirect_uri,
        })
    }

    /// Bind the first port of `ports` that is free.
    pub async fn bind_first_available<I>(ports: I, path: &str) -> Result<Self, AuthError>
    where
        I: IntoIterator<Item = u16>,
    {
        let mut last_err: Option<AuthError> = None;
        for port in ports {
            match Self::bind(port, path).await {
                Ok(listener) => return Ok(listener),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or(AuthError::ListenerClosed))
    }

    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Wait for the redirect and answer the browser.
    ///
    /// Requests for other paths get a 404 and malformed requests a 400; neither
    /// ends the wait.
    pub async fn accept_callback(self) -> Result<CallbackParams, AuthError> {
        loop {
            let (mut stream, addr) = self.listener.accept().await?;
            let mut buffer = [0u8; 8192];
            let n = match stream.read(&mut buffer).await {
                Ok(n) => n,
                Err(err) => {
                    debug!(%addr, error = %err, "dropping unreadable loopback connection");
                    continue;
                }
            };
            let request = String::from_utf8_lossy(&buffer[..n]);
            let url = match parse_request_target(&request)
                .and_then(|target| Ok(self.redirect_uri.join(target)?))
            {
                Ok(url) => url,
                Err(err) => {
                    debug!(%addr, error = %err, "ignoring malformed loopback request");
                    let _ = respond(&mut stream, 400, ERROR_HTML).await;
                    continue;
                }
            };

            if url.path() != self.redirect_uri.path() {
                let _ = respond(&mut stream, 404, NOT_FOUND_HTML).await;
                continue;
            }

            let params = CallbackParams::from_url(&url);
            let (status, body) = if params.error.is_some() || params.code.is_none() {
                (400, ERROR_HTML)
            } else {
                (200, SUCCESS_HTML)
            };
            respond(&mut stream, status, body).await?;
            let _ = stream.shutdown().await;
            return Ok(params);
        }
    }
}

/// Browser login: start it on `manager`, hand the URL to `notify`, wait for the redirect.
///
/// The manager must be configured with the listener's redirect URI.
pub async fn run_loopback_login<F>(
    manager: &SessionManager,
    listener: LoopbackListener,
    open_browser: bool,
    notify_authorization_url: F,
) -> Result<Session, AuthError>
where
    F: Fn(&Url) -> Result<(), AuthError>,
{
    let configured = &manager.protocol().config().redirect_uri;
    if configured != listener.redirect_uri() {
        return Err(ConfigError::InvalidRedirectUri(format!(
            "{configured} does not match listener address {}",
            listener.redirect_uri()
        ))
        .into());
    }

    let auth_url = manager.login().await?;
    notify_authorization_url(&auth_url)?;

    if open_browser {
        if let Err(err) = open::that(auth_url.as_str()) {
            warn!(error = %err, "failed to launch browser; open the printed URL manually");
        }
    }

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = listener.accept_callback().await;
        let _ = tx.send(result);
    });

    let params = match rx.await.map_err(|_| AuthError::ListenerClosed).and_then(|result| result) {
        Ok(params) => params,
        Err(err) => {
            warn!(error = %err, "loopback listener failed; abandoning login");
            manager.cancel_login()?;
            return Err(err);
        }
    };
    manager.handle_callback_params(params).await
}

fn parse_request_target(request: &str) -> Result<&str, AuthError> {
    let first_line = request
        .lines()
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing request line".into()))?;
    let mut parts = first_line.split_whitespace();
    let _method = parts
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing method".into()))?;
    parts
        .next()
        .ok_or_else(|| AuthError::InvalidAuthorizationResponse("missing path".into()))
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) -> Result<(), AuthError> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let response = format!(
        "{status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
