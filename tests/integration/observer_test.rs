//! Listener behaviour through a running application state
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;

use corpreg::{PersistenceMode, Session};

use crate::test_harness::{TestEnvironment, EMAIL, PASSWORD};

#[tokio::test]
async fn test_late_listener_sees_current_session_immediately() {
    let env = TestEnvironment::signed_in().await;

    let first = Arc::new(Mutex::new(None));
    let first_clone = Arc::clone(&first);
    let sub = env.app.observer.subscribe(move |session| {
        first_clone
            .lock()
            .get_or_insert_with(|| session.map(|s| s.email.clone()));
        Ok(())
    });

    assert_eq!(*first.lock(), Some(Some(EMAIL.to_string())));
    sub.unsubscribe();
}

#[tokio::test]
async fn test_listeners_see_every_transition_in_order() {
    let env = TestEnvironment::new().await;
    env.provider.add_account(EMAIL, PASSWORD);
    let auth = &env.app.auth_service;

    auth.login(EMAIL, PASSWORD, PersistenceMode::SessionScoped).await;
    auth.logout().await;
    auth.login(EMAIL, PASSWORD, PersistenceMode::SessionScoped).await;

    // Another tab signs out behind our back
    env.provider.push(None);

    assert_eq!(
        env.seen(),
        vec![
            None,
            Some(EMAIL.to_string()),
            None,
            Some(EMAIL.to_string()),
            None
        ]
    );
    assert!(!auth.is_logged_in());
}

#[tokio::test]
async fn test_failing_listener_does_not_block_others() {
    let env = TestEnvironment::new().await;
    env.provider.add_account(EMAIL, PASSWORD);

    let _failing = env
        .app
        .observer
        .subscribe(|session: Option<&Session>| match session {
            Some(_) => Err(anyhow!("render failed")),
            None => Ok(()),
        });
    let _panicking = env.app.observer.subscribe(|session: Option<&Session>| {
        if session.is_some() {
            panic!("listener bug");
        }
        Ok(())
    });

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    let _counting = env.app.observer.subscribe(move |_| {
        calls_clone.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let result = env
        .app
        .auth_service
        .login(EMAIL, PASSWORD, PersistenceMode::SessionScoped)
        .await;

    assert!(result.is_success());
    // Initial replay plus the sign-in
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(env.seen().last().cloned().flatten().as_deref(), Some(EMAIL));
    assert!(env.app.auth_service.is_logged_in());
}

#[tokio::test]
async fn test_unsubscribed_listener_stops_receiving() {
    let env = TestEnvironment::new().await;
    env.provider.add_account(EMAIL, PASSWORD);

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    let sub = env.app.observer.subscribe(move |_| {
        calls_clone.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    sub.unsubscribe();
    sub.unsubscribe();
    assert!(!sub.is_active());

    env.app
        .auth_service
        .login(EMAIL, PASSWORD, PersistenceMode::SessionScoped)
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // The harness recorder is unaffected
    assert_eq!(env.seen().len(), 2);
}
