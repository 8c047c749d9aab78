//! Session persistence across simulated restarts
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::fs;

use corpreg::auth::providers::memory::AccountDirectory;
use corpreg::{AppState, InMemoryProvider, PersistenceMode, SessionStore};

use crate::test_harness::{provider_run, EMAIL, PASSWORD};

async fn first_run(
    directory: &AccountDirectory,
    store_path: &Path,
    mode: PersistenceMode,
) -> AppState {
    let provider = provider_run(directory, store_path);
    provider.add_account(EMAIL, PASSWORD);

    let app = AppState::with_provider(Arc::new(provider)).await;
    let result = app.auth_service.login(EMAIL, PASSWORD, mode).await;
    assert!(result.is_success());
    app
}

#[tokio::test]
async fn test_durable_session_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store_path = dir.path().join("sessions.json");
    let directory = AccountDirectory::new();

    let app = first_run(&directory, &store_path, PersistenceMode::DurableLocal).await;
    drop(app);

    let restarted =
        AppState::with_provider(Arc::new(provider_run(&directory, &store_path))).await;

    let user = restarted.auth_service.current_user().expect("session restored");
    assert_eq!(user.email, EMAIL);
    assert!(restarted.auth_service.get_token(false).await.is_some());
    Ok(())
}

#[tokio::test]
async fn test_session_scoped_does_not_survive_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store_path = dir.path().join("sessions.json");
    let directory = AccountDirectory::new();

    let app = first_run(&directory, &store_path, PersistenceMode::SessionScoped).await;
    assert!(app.auth_service.is_logged_in());
    drop(app);

    let restarted =
        AppState::with_provider(Arc::new(provider_run(&directory, &store_path))).await;
    assert!(!restarted.auth_service.is_logged_in());
    Ok(())
}

#[tokio::test]
async fn test_logout_clears_durable_session() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store_path = dir.path().join("sessions.json");
    let directory = AccountDirectory::new();

    let app = first_run(&directory, &store_path, PersistenceMode::DurableLocal).await;
    assert!(app.auth_service.logout().await.is_success());
    drop(app);

    let store = SessionStore::new(&store_path, "corpreg");
    assert!(store.retrieve().await?.is_none());

    let restarted =
        AppState::with_provider(Arc::new(provider_run(&directory, &store_path))).await;
    assert!(!restarted.auth_service.is_logged_in());
    Ok(())
}

#[tokio::test]
async fn test_session_scoped_login_replaces_durable_entry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store_path = dir.path().join("sessions.json");
    let directory = AccountDirectory::new();

    let app = first_run(&directory, &store_path, PersistenceMode::DurableLocal).await;
    let again = app
        .auth_service
        .login(EMAIL, PASSWORD, PersistenceMode::SessionScoped)
        .await;
    assert!(again.is_success());
    drop(app);

    let store = SessionStore::new(&store_path, "corpreg");
    assert!(store.retrieve().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_tampered_store_is_discarded_on_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store_path = dir.path().join("sessions.json");
    let directory = AccountDirectory::new();

    let app = first_run(&directory, &store_path, PersistenceMode::DurableLocal).await;
    drop(app);

    let contents = fs::read_to_string(&store_path).await?;
    fs::write(&store_path, contents.replace(EMAIL, "mallory@example.com")).await?;

    let restarted =
        AppState::with_provider(Arc::new(provider_run(&directory, &store_path))).await;
    assert!(!restarted.auth_service.is_logged_in());

    // The bad entry is gone rather than failing every start
    let store = SessionStore::new(&store_path, "corpreg");
    assert!(store.retrieve().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_deleted_account_is_not_restored() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store_path = dir.path().join("sessions.json");
    let directory = AccountDirectory::new();

    let app = first_run(&directory, &store_path, PersistenceMode::DurableLocal).await;
    drop(app);

    // Another device removes the account in the meantime
    assert_eq!(directory.len(), 1);
    let cleanup = AppState::with_provider(Arc::new(
        InMemoryProvider::new().with_directory(directory.clone()),
    ))
    .await;
    cleanup
        .auth_service
        .login(EMAIL, PASSWORD, PersistenceMode::SessionScoped)
        .await;
    assert!(cleanup.auth_service.delete_account().await.is_success());
    assert!(directory.is_empty());
    drop(cleanup);

    let restarted =
        AppState::with_provider(Arc::new(provider_run(&directory, &store_path))).await;
    assert!(!restarted.auth_service.is_logged_in());
    Ok(())
}

#[tokio::test]
async fn test_mode_stays_in_force_for_later_sign_ups() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store_path = dir.path().join("sessions.json");
    let directory = AccountDirectory::new();

    let app = first_run(&directory, &store_path, PersistenceMode::DurableLocal).await;
    assert!(app.auth_service.logout().await.is_success());

    // No mode is passed to register; the remembered-login mode still applies
    let registered = app
        .auth_service
        .register("grace@example.com", PASSWORD, None)
        .await;
    assert!(registered.is_success());
    drop(app);

    let store = SessionStore::new(&store_path, "corpreg");
    let stored = store.retrieve().await?.expect("new account stored durably");
    assert_eq!(stored.session.email, "grace@example.com");

    let restarted =
        AppState::with_provider(Arc::new(provider_run(&directory, &store_path))).await;
    assert_eq!(
        restarted.auth_service.current_user().map(|u| u.email),
        Some("grace@example.com".to_string())
    );
    Ok(())
}
