use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use oidc_rp_core::auth::{
    run_loopback_login, run_manual_login, AuthError, FileBackend, FlowPreference, LoginFlow,
    LoopbackListener, ProtocolClient, Session, SessionManager, StorageScope, TokenStore,
};
use oidc_rp_core::config::{ConfigLocator, RpConfig};
use serde_json::json;
use tokio::task;
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8765/callback";
const LOOPBACK_PORTS: std::ops::RangeInclusive<u16> = 8765..=8775;

#[derive(Parser, Debug)]
#[command(author, version, about = "OpenID Connect relying-party session manager")]
struct Cli {
    #[command(flatten)]
    provider: ProviderArgs,
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ProviderArgs {
    /// Issuer URL of the OpenID provider
    #[arg(long, env = "OIDC_RP_ISSUER", global = true)]
    issuer: Option<String>,
    /// Client identifier registered with the provider
    #[arg(long = "client-id", env = "OIDC_RP_CLIENT_ID", global = true)]
    client_id: Option<String>,
    /// Client secret for confidential clients
    #[arg(long = "client-secret", env = "OIDC_RP_CLIENT_SECRET", hide_env_values = true, global = true)]
    client_secret: Option<String>,
    /// Space separated scopes to request
    #[arg(long, env = "OIDC_RP_SCOPES", default_value = "openid profile", global = true)]
    scope: String,
    /// Redirect URI registered for this client
    #[arg(long = "redirect-uri", env = "OIDC_RP_REDIRECT_URI", default_value = DEFAULT_REDIRECT_URI, global = true)]
    redirect_uri: Url,
    /// Where the provider should send the browser after logout
    #[arg(long = "post-logout-redirect-uri", env = "OIDC_RP_POST_LOGOUT_REDIRECT_URI", global = true)]
    post_logout_redirect_uri: Option<Url>,
    /// Directory for persisted session state
    #[arg(long = "store-dir", env = "OIDC_RP_STORE_DIR", global = true)]
    store_dir: Option<PathBuf>,
    /// Seconds before expiry at which tokens are renewed
    #[arg(long = "renewal-lead", env = "OIDC_RP_RENEWAL_LEAD", global = true)]
    renewal_lead: Option<i64>,
    /// Merge userinfo claims into the session profile
    #[arg(long = "user-info", global = true)]
    user_info: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in with the authorization code flow
    Login(LoginArgs),
    /// Sign out and print the provider's end-session URL
    Logout(LogoutArgs),
    /// Show the stored session
    Status(StatusArgs),
    /// Renew the stored session now
    Renew,
    /// Print the provider's discovery document
    Discover,
}

#[derive(Args, Debug)]
struct LoginArgs {
    /// Use manual copy/paste flow instead of a loopback listener
    #[arg(long)]
    manual: bool,
    /// Print the authorization URL without launching a browser
    #[arg(long = "no-browser")]
    no_browser: bool,
    /// Abandon a pending login before starting
    #[arg(long)]
    restart: bool,
}

#[derive(Args, Debug)]
struct LogoutArgs {
    /// Forget the session locally without revoking tokens or ending the provider session
    #[arg(long)]
    local: bool,
    /// Revoke access and refresh tokens at the provider
    #[arg(long)]
    revoke: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Login(args) => login(&cli.provider, args).await?,
        Commands::Logout(args) => logout(&cli.provider, args).await?,
        Commands::Status(args) => status(&cli.provider, args).await?,
        Commands::Renew => renew(&cli.provider).await?,
        Commands::Discover => discover(&cli.provider).await?,
    }
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(args: &ProviderArgs) -> Result<RpConfig> {
    let issuer = args
        .issuer
        .clone()
        .ok_or_else(|| anyhow!("missing --issuer (or OIDC_RP_ISSUER)"))?;
    let client_id = args
        .client_id
        .clone()
        .ok_or_else(|| anyhow!("missing --client-id (or OIDC_RP_CLIENT_ID)"))?;

    let mut config = RpConfig::new(issuer, client_id, args.redirect_uri.clone())
        .with_scopes(args.scope.split_whitespace())
        .with_user_info(args.user_info);
    if let Some(secret) = args.client_secret.as_deref().filter(|s| !s.trim().is_empty()) {
        config = config.with_secret(secret);
    }
    if let Some(uri) = &args.post_logout_redirect_uri {
        config = config.with_post_logout_redirect(uri.clone());
    }
    if let Some(lead) = args.renewal_lead {
        config = config.with_renewal_lead(Duration::seconds(lead));
    }
    config.validate().context("invalid relying-party configuration")?;
    Ok(config)
}

fn build_manager(args: &ProviderArgs, config: RpConfig) -> Result<SessionManager> {
    let locator = match &args.store_dir {
        Some(dir) => ConfigLocator::from_root(dir.clone()),
        None => ConfigLocator::new(),
    }
    .context("unable to locate session storage directory")?;
    let backend = FileBackend::with_locator(&locator).context("unable to open session storage")?;
    let store = TokenStore::new(
        Arc::new(backend),
        StorageScope::new(config.normalized_issuer(), &config.client_id),
    );
    let protocol = ProtocolClient::new(config).context("failed to build protocol client")?;
    Ok(SessionManager::new(protocol, store))
}

async fn login(provider: &ProviderArgs, args: LoginArgs) -> Result<()> {
    let mut config = build_config(provider)?;
    let preference = FlowPreference::detect();
    let flow = if args.manual {
        LoginFlow::Manual
    } else {
        preference.preferred()
    };
    let open_browser = !args.no_browser && preference.browser_available();

    let listener = match flow {
        LoginFlow::Browser => Some(bind_listener(&mut config).await?),
        LoginFlow::Manual => None,
    };

    let manager = build_manager(provider, config)?;
    manager.initialize().await?;
    if args.restart && manager.cancel_login()? {
        eprintln!("Abandoned the previous pending login.");
    }

    let attempt = async {
        match listener {
            Some(listener) => {
                run_loopback_login(&manager, listener, open_browser, print_authorization_url).await
            }
            None => {
                run_manual_login(&manager, open_browser, print_authorization_url, prompt_for_redirect)
                    .await
            }
        }
    };

    let session = tokio::select! {
        result = attempt => match result {
            Err(AuthError::OperationInProgress) => bail!(
                "another login is pending; finish it or run `oidc-rp login --restart`"
            ),
            other => other.context("login failed")?,
        },
        _ = tokio::signal::ctrl_c() => {
            manager.cancel_login()?;
            bail!("login interrupted");
        }
    };

    println!("Login succeeded.");
    print_session(&session);
    Ok(())
}

async fn bind_listener(config: &mut RpConfig) -> Result<LoopbackListener> {
    let redirect = config.redirect_uri.clone();
    let listener = match redirect.port() {
        Some(port) => LoopbackListener::bind(port, redirect.path())
            .await
            .with_context(|| format!("unable to listen on port {port}"))?,
        None => LoopbackListener::bind_first_available(LOOPBACK_PORTS, redirect.path())
            .await
            .context("no free loopback port for the redirect listener")?,
    };
    if listener.redirect_uri() != &redirect {
        tracing::warn!(
            configured = %redirect,
            listening = %listener.redirect_uri(),
            "using the loopback address as redirect URI"
        );
        config.redirect_uri = listener.redirect_uri().clone();
    }
    Ok(listener)
}

async fn logout(provider: &ProviderArgs, args: LogoutArgs) -> Result<()> {
    let config = build_config(provider)?.with_revoke_on_logout(args.revoke);
    let manager = build_manager(provider, config)?;
    let previous = manager.initialize().await?;

    if args.local {
        manager.remove_user()?;
    } else if let Some(url) = manager.logout().await? {
        println!("\nEnd the provider session by visiting:\n  {url}\n");
    }

    match previous {
        Some(session) => println!("Signed out {}.", display_name(&session)),
        None => println!("No session was stored."),
    }
    Ok(())
}

async fn status(provider: &ProviderArgs, args: StatusArgs) -> Result<()> {
    let manager = build_manager(provider, build_config(provider)?)?;
    let session = manager.initialize().await?;
    let pending = manager.pending_request()?;

    if args.json {
        let value = json!({
            "signed_in": session.is_some(),
            "subject": session.as_ref().map(|s| s.subject.clone()),
            "expires_at": session.as_ref().map(|s| s.expires_at.to_rfc3339()),
            "expired": session.as_ref().map(Session::is_expired),
            "scope": session.as_ref().map(|s| s.scope.clone()),
            "profile": session.as_ref().map(|s| s.profile.clone()),
            "renewable": session.as_ref().map(|s| s.refresh_token.is_some()),
            "pending_login_since": pending.as_ref().map(|p| p.created_at.to_rfc3339()),
            "renewal": manager.renewal_state().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match &session {
        Some(session) => {
            print_session(session);
            println!("Renewal   : {}", manager.renewal_state());
        }
        None => println!("Not signed in."),
    }
    if let Some(pending) = pending {
        println!("A login is pending since {}.", pending.created_at.to_rfc3339());
    }
    Ok(())
}

async fn renew(provider: &ProviderArgs) -> Result<()> {
    let manager = build_manager(provider, build_config(provider)?)?;
    if manager.initialize().await?.is_none() {
        bail!("not signed in; run `oidc-rp login`");
    }
    let session = match manager.renew_now().await {
        Err(err) if err.is_terminal() => {
            manager.remove_user()?;
            bail!("session can no longer be renewed ({err}); run `oidc-rp login` again");
        }
        other => other.context("renewal failed")?,
    };
    println!("Session renewed.");
    print_session(&session);
    Ok(())
}

async fn discover(provider: &ProviderArgs) -> Result<()> {
    let protocol = ProtocolClient::new(build_config(provider)?).context("failed to build protocol client")?;
    let document = protocol
        .fetch_discovery_document()
        .await
        .context("discovery failed")?;
    println!("{}", serde_json::to_string_pretty(document.as_ref())?);
    Ok(())
}

async fn prompt_for_redirect() -> Result<String, AuthError> {
    task::spawn_blocking(|| -> Result<String, AuthError> {
        use std::io::{self, Write};
        print!("Paste the full redirect URL: ");
        io::stdout().flush().map_err(AuthError::Io)?;
        let mut input = String::new();
        io::stdin().read_line(&mut input).map_err(AuthError::Io)?;
        Ok(input.trim().to_owned())
    })
    .await
    .map_err(|_| AuthError::Cancelled)?
}

fn print_authorization_url(url: &Url) -> Result<(), AuthError> {
    println!("\nSign in by visiting:\n  {url}\n");
    Ok(())
}

fn display_name(session: &Session) -> String {
    ["email", "preferred_username", "name"]
        .iter()
        .find_map(|claim| session.profile.get(*claim).and_then(|v| v.as_str()))
        .map(str::to_owned)
        .unwrap_or_else(|| session.subject.clone())
}

fn print_session(session: &Session) {
    println!("Subject   : {}", session.subject);
    let name = display_name(session);
    if name != session.subject {
        println!("User      : {name}");
    }
    println!("Scopes    : {}", session.scope.join(" "));
    let remaining = session.expires_at - Utc::now();
    if remaining > Duration::zero() {
        let soon = if session.will_expire_within(Duration::minutes(5)) {
            ", renewal due"
        } else {
            ""
        };
        println!(
            "Expires   : {} (in {} min{soon})",
            session.expires_at.to_rfc3339(),
            remaining.num_minutes()
        );
    } else {
        println!("Expires   : {} (expired)", session.expires_at.to_rfc3339());
    }
    println!(
        "Renewable : {}",
        if session.refresh_token.is_some() { "yes" } else { "no" }
    );
}
