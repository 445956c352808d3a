//! Session gate: password login with per-address lockout, cookie sessions
//! with an absolute lifetime, and the CSRF token paired with each session.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::error::ApiError;

pub const SESSION_COOKIE: &str = "talaria_session";
pub const CSRF_COOKIE: &str = "talaria_csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";

pub const SESSION_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const MAX_LOGIN_ATTEMPTS: u32 = 5;
pub const LOCKOUT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// bcrypt only looks at the first 72 bytes.
pub const MAX_PASSWORD_BYTES: usize = 72;

/// Cost used for hashes printed by `--hash-password` and temporary passwords.
pub const HASH_COST: u32 = 12;

// Failure records are swept once the table grows past this.
const LIMITER_SWEEP_AT: usize = 1024;

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub csrf: String,
    created_at: Instant,
}

impl Session {
    fn expired(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }

    /// Constant-time check of a submitted CSRF token.
    pub fn csrf_matches(&self, submitted: &str) -> bool {
        !submitted.is_empty() && bool::from(self.csrf.as_bytes().ct_eq(submitted.as_bytes()))
    }
}

/// `n` random bytes from the OS-seeded CSPRNG, hex encoded.
pub fn random_token(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    max_age: Duration,
}

impl SessionStore {
    pub fn new(max_age: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_age,
        }
    }

    pub fn create(&self) -> Session {
        let session = Session {
            token: random_token(32),
            csrf: random_token(16),
            created_at: Instant::now(),
        };
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.token.clone(), session.clone());
        session
    }

    /// The live session for `token`. An expired one is deleted on the way out.
    pub fn get(&self, token: &str) -> Option<Session> {
        let found = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()?;
        if found.expired(self.max_age) {
            self.remove(token);
            return None;
        }
        Some(found)
    }

    pub fn remove(&self, token: &str) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Failures {
    count: u32,
    last: Instant,
}

/// Per-source-address login failure counter.
pub struct LoginLimiter {
    failures: Mutex<HashMap<String, Failures>>,
    max_attempts: u32,
    window: Duration,
}

impl LoginLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            max_attempts,
            window,
        }
    }

    /// Remaining attempts for `addr`, or `RateLimited` while locked out.
    pub fn check(&self, addr: &str) -> Result<u32, ApiError> {
        let mut failures = self.lock();
        let Some(f) = failures.get(addr) else {
            return Ok(self.max_attempts);
        };
        let elapsed = f.last.elapsed();
        if elapsed > self.window {
            failures.remove(addr);
            return Ok(self.max_attempts);
        }
        if f.count >= self.max_attempts {
            let left = self.window.saturating_sub(elapsed);
            return Err(ApiError::RateLimited {
                locked_until: epoch_secs() + left.as_secs() as i64,
            });
        }
        Ok(self.max_attempts - f.count)
    }

    /// Claim one attempt for `addr` and return the attempts left after it.
    ///
    /// The check and the increment share one critical section, so concurrent
    /// attempts from one address can never exceed the budget between them.
    /// A successful attempt is handed back with [`clear`](Self::clear), an
    /// attempt that was never judged with [`refund`](Self::refund).
    pub fn reserve(&self, addr: &str) -> Result<u32, ApiError> {
        let mut failures = self.lock();
        if failures.len() >= LIMITER_SWEEP_AT {
            let window = self.window;
            failures.retain(|_, f| f.last.elapsed() <= window);
        }
        let now = Instant::now();
        let f = failures.entry(addr.to_string()).or_insert(Failures {
            count: 0,
            last: now,
        });
        let elapsed = now.duration_since(f.last);
        if elapsed > self.window {
            f.count = 0;
        }
        if f.count >= self.max_attempts {
            let left = self.window.saturating_sub(elapsed);
            return Err(ApiError::RateLimited {
                locked_until: epoch_secs() + left.as_secs() as i64,
            });
        }
        f.count += 1;
        f.last = now;
        if f.count >= self.max_attempts {
            warn!(addr, "login locked out");
        }
        Ok(self.max_attempts - f.count)
    }

    /// Give back an attempt claimed by [`reserve`](Self::reserve).
    pub fn refund(&self, addr: &str) {
        let mut failures = self.lock();
        if let Some(f) = failures.get_mut(addr) {
            f.count = f.count.saturating_sub(1);
            if f.count == 0 {
                failures.remove(addr);
            }
        }
    }

    pub fn clear(&self, addr: &str) {
        self.lock().remove(addr);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Failures>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Everything the HTTP layer needs to authenticate a request.
pub struct Gate {
    pub sessions: SessionStore,
    pub limiter: LoginLimiter,
    password_hash: String,
}

impl Gate {
    pub fn new(password_hash: String) -> Self {
        Self::with_limits(password_hash, SESSION_MAX_AGE, MAX_LOGIN_ATTEMPTS, LOCKOUT_WINDOW)
    }

    pub fn with_limits(
        password_hash: String,
        session_max_age: Duration,
        max_attempts: u32,
        lockout: Duration,
    ) -> Self {
        Self {
            sessions: SessionStore::new(session_max_age),
            limiter: LoginLimiter::new(max_attempts, lockout),
            password_hash,
        }
    }

    /// Verify `password` for a client at `addr`. A locked-out address is
    /// refused before the password is looked at.
    pub async fn login(&self, addr: &str, password: &str) -> Result<Session, ApiError> {
        let remaining = self.limiter.reserve(addr)?;

        if password.is_empty() || password.len() > MAX_PASSWORD_BYTES {
            return Err(ApiError::InvalidPassword { remaining });
        }

        let hash = self.password_hash.clone();
        let candidate = password.to_string();
        let verify = tokio::task::spawn_blocking(move || bcrypt::verify(candidate, &hash));
        let verified = match verify.await {
            Ok(v) => v,
            Err(e) => {
                self.limiter.refund(addr);
                return Err(ApiError::Internal(e.into()));
            }
        };
        match verified {
            Ok(true) => {
                self.limiter.clear(addr);
                let session = self.sessions.create();
                info!(addr, "login succeeded");
                Ok(session)
            }
            Ok(false) => {
                warn!(addr, remaining, "login failed");
                Err(ApiError::InvalidPassword { remaining })
            }
            Err(e) => {
                self.limiter.refund(addr);
                Err(ApiError::Internal(
                    anyhow::Error::new(e).context("verifying password hash"),
                ))
            }
        }
    }

    pub fn logout(&self, token: &str) {
        self.sessions.remove(token);
    }
}

/// `Set-Cookie` value for a freshly minted session cookie.
pub fn session_cookie(name: &str, value: &str, http_only: bool, secure: bool) -> String {
    let mut cookie = format!(
        "{name}={value}; Path=/; Max-Age={}; SameSite=Strict",
        SESSION_MAX_AGE.as_secs()
    );
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value that deletes `name` in the browser.
pub fn expired_cookie(name: &str) -> String {
    format!("{name}=; Path=/; Max-Age=0; SameSite=Strict")
}

/// Value of cookie `name` from a `Cookie` request header.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_have_expected_shape() {
        let store = SessionStore::new(SESSION_MAX_AGE);
        let s = store.create();
        assert_eq!(s.token.len(), 64);
        assert_eq!(s.csrf.len(), 32);
        assert!(s.token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(store.create().token, s.token);
    }

    #[test]
    fn expired_session_is_deleted_on_access() {
        let store = SessionStore::new(Duration::from_millis(20));
        let s = store.create();
        assert!(store.get(&s.token).is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(store.get(&s.token).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn csrf_comparison() {
        let store = SessionStore::new(SESSION_MAX_AGE);
        let s = store.create();
        assert!(s.csrf_matches(&s.csrf.clone()));
        assert!(!s.csrf_matches(""));
        assert!(!s.csrf_matches("deadbeef"));
    }

    #[test]
    fn limiter_counts_down_then_locks() {
        let limiter = LoginLimiter::new(3, Duration::from_secs(60));
        assert_eq!(limiter.check("10.0.0.1").unwrap(), 3);
        assert_eq!(limiter.reserve("10.0.0.1").unwrap(), 2);
        assert_eq!(limiter.reserve("10.0.0.1").unwrap(), 1);
        assert_eq!(limiter.reserve("10.0.0.1").unwrap(), 0);
        match limiter.check("10.0.0.1") {
            Err(ApiError::RateLimited { locked_until }) => assert!(locked_until > epoch_secs()),
            other => panic!("expected lockout, got {other:?}"),
        }
        assert!(matches!(
            limiter.reserve("10.0.0.1"),
            Err(ApiError::RateLimited { .. })
        ));
        // Other addresses are unaffected.
        assert_eq!(limiter.check("10.0.0.2").unwrap(), 3);
    }

    #[test]
    fn refund_returns_an_attempt() {
        let limiter = LoginLimiter::new(2, Duration::from_secs(60));
        assert_eq!(limiter.reserve("10.0.0.3").unwrap(), 1);
        limiter.refund("10.0.0.3");
        assert_eq!(limiter.check("10.0.0.3").unwrap(), 2);
        // Refunding an unknown address is a no-op.
        limiter.refund("10.0.0.4");
        assert_eq!(limiter.check("10.0.0.4").unwrap(), 2);
    }

    #[test]
    fn cookie_helpers() {
        let c = session_cookie(SESSION_COOKIE, "abc", true, true);
        assert!(c.starts_with("talaria_session=abc;"));
        assert!(c.contains("HttpOnly"));
        assert!(c.contains("Secure"));
        assert!(c.contains("Max-Age=86400"));
        assert!(!session_cookie(CSRF_COOKIE, "x", false, false).contains("HttpOnly"));

        let header = "theme=dark; talaria_session=tok123; talaria_csrf=c5";
        assert_eq!(cookie_value(header, SESSION_COOKIE), Some("tok123"));
        assert_eq!(cookie_value(header, CSRF_COOKIE), Some("c5"));
        assert_eq!(cookie_value(header, "missing"), None);
    }
}
