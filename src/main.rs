use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use corpreg::config::{self, Config};
use corpreg::{
    AppState, IdentityProvider, InMemoryProvider, Notice, NoticeKind, OperationResult,
    PersistenceMode,
};

const HELP: &str = "\
Commands:
  register <email> <password> [display name]
  login <email> <password> [remember]
  logout
  reset <email>
  whoami
  token [refresh]
  verify
  delete
  quit";

/// Choose the provider: in-memory when asked for or when no project is configured
async fn start_app(config: &Config, offline: bool) -> Result<AppState> {
    if offline || config.provider.api_key.is_empty() {
        if !offline {
            warn!("No provider API key configured, running with the in-memory provider");
        }
        let provider: Arc<dyn IdentityProvider> = Arc::new(InMemoryProvider::new());
        return Ok(AppState::with_provider(provider).await);
    }

    AppState::new(config).await
}

fn print_notice(notice: &Notice) {
    match notice.kind {
        NoticeKind::Success => println!("[ok] {}", notice.message),
        NoticeKind::Error => println!("[error] {}", notice.message),
    }
}

fn report(result: &OperationResult) {
    print_notice(&result.notice());
    if let Some(category) = result.category() {
        debug!(operation = %result.operation(), %category, "Operation failed");
    }
}

/// Run one console command. Returns false when the session should end.
async fn handle_command(app: &AppState, config: &Config, line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let auth = &app.auth_service;

    match parts.as_slice() {
        [] => {}
        ["quit"] | ["exit"] => return false,
        ["help"] => println!("{HELP}"),
        ["register", email, password, name @ ..] => {
            let name = name.join(" ");
            let display_name = (!name.is_empty()).then_some(name.as_str());
            report(&auth.register(email, password, display_name).await);
        }
        ["login", email, password, rest @ ..] => {
            let persistence = match rest {
                ["remember"] => PersistenceMode::DurableLocal,
                [] => config.session.default_persistence,
                _ => {
                    println!("usage: login <email> <password> [remember]");
                    return true;
                }
            };
            report(&auth.login(email, password, persistence).await);
        }
        ["logout"] => report(&auth.logout().await),
        ["reset", email] => report(&auth.send_password_reset(email).await),
        ["verify"] => report(&auth.resend_verification().await),
        ["delete"] => report(&auth.delete_account().await),
        ["whoami"] => match auth.current_user() {
            Some(user) => println!(
                "{} <{}>{}",
                user.display_name.as_deref().unwrap_or("(no name)"),
                user.email,
                if user.email_verified { "" } else { " (unverified)" }
            ),
            None => println!("Not signed in."),
        },
        ["token", rest @ ..] => {
            let force_refresh = matches!(rest, ["refresh"]);
            match auth.get_token(force_refresh).await {
                Some(token) => println!("{token}"),
                None => println!("No token available."),
            }
        }
        _ => println!("Unknown command. Type 'help' for a list."),
    }

    true
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    let env_file_path = dotenvy::dotenv().ok();

    // Initialize the tracing subscriber for structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "corpreg=debug,warn".into()
            } else {
                "corpreg=info,warn".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    info!("corpreg starting");

    // Log environment loading after logger is initialized
    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    };

    let offline = std::env::args().skip(1).any(|arg| arg == "--offline");
    let config = config::load_config().await?;
    let app = start_app(&config, offline).await?;

    let listener = app.observer.subscribe(|session| {
        match session {
            Some(user) => info!(uid = %user.uid, email = %user.email, "Signed in"),
            None => info!("Signed out"),
        }
        Ok(())
    });

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(%e, "Failed to read from stdin");
                break;
            }
        };

        if !handle_command(&app, &config, line.trim()).await {
            break;
        }
    }

    listener.unsubscribe();
    app.shutdown();
    info!("corpreg stopped");
    Ok(())
}
