//! ==============================================================================
//! auth.rs - explicit authentication context
//! ==============================================================================
//!
//! purpose:
//!     the engine never reads a global token. it is handed an AuthContext
//!     (current bearer token + change notifications) at construction, and
//!     whoever owns the TokenSetter drives login/logout.
//!
//! relationships:
//!     - used by: engine.rs (subscribes, restarts on token change)
//!     - used by: main.rs (seeds from config, optional token file watcher)
//!
//! ==============================================================================

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// read side: current token and a change channel
#[derive(Debug, Clone)]
pub struct AuthContext {
    rx: watch::Receiver<Option<String>>,
}

/// write side: login / logout
#[derive(Debug, Clone)]
pub struct TokenSetter {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl AuthContext {
    pub fn new(initial: Option<String>) -> (Self, TokenSetter) {
        let (tx, rx) = watch::channel(normalize(initial));
        (Self { rx }, TokenSetter { tx: Arc::new(tx) })
    }

    pub fn token(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.rx.clone()
    }
}

impl TokenSetter {
    /// returns true when the token actually changed
    pub fn set(&self, token: Option<String>) -> bool {
        let token = normalize(token);
        self.tx.send_if_modified(|current| {
            if *current == token {
                false
            } else {
                *current = token;
                true
            }
        })
    }

    /// logout
    pub fn clear(&self) -> bool {
        self.set(None)
    }
}

/// blank tokens mean "not logged in"
fn normalize(token: Option<String>) -> Option<String> {
    token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

pub fn read_token_file(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => normalize(Some(content)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "token file unreadable, treating as logged out");
            None
        }
    }
}

// ==============================================================================
// token file watcher
// ==============================================================================
// a login helper writes the bearer token to a file; the watcher pushes every
// change (including deletion = logout) through the setter. the watcher stops
// when the returned handle is dropped.

pub fn watch_token_file(path: impl Into<PathBuf>, setter: TokenSetter) -> notify::Result<RecommendedWatcher> {
    let path = path.into();
    setter.set(read_token_file(&path));

    let watched = path.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) && event.paths.iter().any(|p| p.file_name() == watched.file_name());
            if relevant && setter.set(read_token_file(&watched)) {
                info!(path = %watched.display(), "token file changed");
            }
        }
        Err(e) => warn!(error = %e, "token file watch error"),
    })?;

    // watch the directory so editors that replace the file are still seen
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_token_is_logged_out() {
        let (auth, _setter) = AuthContext::new(Some("   ".into()));
        assert!(!auth.is_authenticated());
        assert_eq!(auth.token(), None);
    }

    #[tokio::test]
    async fn setter_notifies_only_on_change() {
        let (auth, setter) = AuthContext::new(Some("t1".into()));
        let mut rx = auth.subscribe();
        rx.borrow_and_update();

        assert!(!setter.set(Some("t1".into())));
        assert!(!rx.has_changed().unwrap());

        assert!(setter.set(Some("t2\n".into())));
        assert!(rx.has_changed().unwrap());
        assert_eq!(auth.token().as_deref(), Some("t2"));

        assert!(setter.clear());
        assert_eq!(auth.token(), None);
    }

    #[test]
    fn reads_trimmed_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "abc.def\n").unwrap();
        assert_eq!(read_token_file(&path).as_deref(), Some("abc.def"));
        assert_eq!(read_token_file(&dir.path().join("missing")), None);
    }

    #[test]
    fn watcher_seeds_current_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "seed").unwrap();

        let (auth, setter) = AuthContext::new(None);
        let _watcher = watch_token_file(&path, setter).unwrap();
        assert_eq!(auth.token().as_deref(), Some("seed"));
    }
}
