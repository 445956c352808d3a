//! Login gate: bcrypt verification, lockout, session lifetime.

use std::sync::Arc;
use std::time::Duration;

use talaria_agent::error::ApiError;
use talaria_agent::session::{Gate, MAX_LOGIN_ATTEMPTS};

const PASSWORD: &str = "correct horse";

fn hash() -> String {
    bcrypt::hash(PASSWORD, 4).expect("hash")
}

fn remaining(r: Result<impl std::fmt::Debug, ApiError>) -> u32 {
    match r {
        Err(ApiError::InvalidPassword { remaining }) => remaining,
        other => panic!("expected InvalidPassword, got {other:?}"),
    }
}

#[tokio::test]
async fn correct_password_opens_a_session() {
    let gate = Gate::new(hash());
    let s = gate.login("10.1.1.1", PASSWORD).await.unwrap();
    let found = gate.sessions.get(&s.token).expect("session stored");
    assert_eq!(found.csrf, s.csrf);

    gate.logout(&s.token);
    assert!(gate.sessions.get(&s.token).is_none());
}

#[tokio::test]
async fn failures_count_down_then_lock_out() {
    let gate = Gate::new(hash());
    let addr = "10.1.1.2";
    for expected in (0..MAX_LOGIN_ATTEMPTS).rev() {
        assert_eq!(remaining(gate.login(addr, "nope").await), expected);
    }
    // Locked: even the right password is refused.
    match gate.login(addr, PASSWORD).await {
        Err(ApiError::RateLimited { locked_until }) => assert!(locked_until > 0),
        other => panic!("expected lockout, got {other:?}"),
    }
    // A different source address is unaffected.
    assert!(gate.login("10.1.1.3", PASSWORD).await.is_ok());
    assert!(gate.sessions.len() == 1);
}

#[tokio::test]
async fn lockout_lifts_after_window() {
    let gate = Gate::with_limits(hash(), Duration::from_secs(60), 2, Duration::from_millis(150));
    let addr = "10.1.1.4";
    remaining(gate.login(addr, "bad").await);
    remaining(gate.login(addr, "bad").await);
    assert!(matches!(
        gate.login(addr, PASSWORD).await,
        Err(ApiError::RateLimited { .. })
    ));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(gate.login(addr, PASSWORD).await.is_ok());
}

#[tokio::test]
async fn success_resets_the_failure_count() {
    let gate = Gate::with_limits(hash(), Duration::from_secs(60), 3, Duration::from_secs(60));
    let addr = "10.1.1.5";
    assert_eq!(remaining(gate.login(addr, "bad").await), 2);
    gate.login(addr, PASSWORD).await.unwrap();
    assert_eq!(remaining(gate.login(addr, "bad").await), 2);
}

#[tokio::test]
async fn empty_and_oversized_passwords_count_as_failures() {
    let gate = Gate::with_limits(hash(), Duration::from_secs(60), 3, Duration::from_secs(60));
    let addr = "10.1.1.6";
    assert_eq!(remaining(gate.login(addr, "").await), 2);
    let long = "x".repeat(73);
    assert_eq!(remaining(gate.login(addr, &long).await), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attempts_cannot_exceed_the_budget() {
    let gate = Arc::new(Gate::new(bcrypt::hash(PASSWORD, 8).expect("hash")));
    let tasks: Vec<_> = (0..30)
        .map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.login("10.1.1.9", "wrong").await })
        })
        .collect();

    let (mut judged, mut limited) = (0, 0);
    for t in tasks {
        match t.await.unwrap() {
            Err(ApiError::InvalidPassword { .. }) => judged += 1,
            Err(ApiError::RateLimited { .. }) => limited += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(judged, MAX_LOGIN_ATTEMPTS as usize);
    assert_eq!(limited, 30 - MAX_LOGIN_ATTEMPTS as usize);
}

#[tokio::test]
async fn sessions_expire_after_max_age() {
    let gate = Gate::with_limits(hash(), Duration::from_millis(50), 5, Duration::from_secs(60));
    let s = gate.login("10.1.1.7", PASSWORD).await.unwrap();
    assert!(gate.sessions.get(&s.token).is_some());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gate.sessions.get(&s.token).is_none());
    assert!(gate.sessions.is_empty());
}

#[tokio::test]
async fn unknown_tokens_resolve_to_nothing() {
    let gate = Gate::new(hash());
    assert!(gate.sessions.get("").is_none());
    assert!(gate.sessions.get("deadbeef").is_none());
}
