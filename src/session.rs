use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::fs;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::models::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
}

/// Where the bearer token lives between runs.
pub trait TokenStore : Send + Sync {
    fn load(&self) -> io::Result<Option<String>>;
    fn save(&self, token : &str) -> io::Result<()>;

    /// Removing a token that is not there is not an error.
    fn remove(&self) -> io::Result<()>;
}

/// Keeps the token in a single file.
pub struct FileStore {
    path : PathBuf,
}

impl FileStore {
    pub fn new<P : Into<PathBuf>>(path : P) -> Self {
        Self{ path : path.into() }
    }

    /// `<data dir>/calc-client/token`, or `./.calc-token` when the platform
    /// has no data dir.
    pub fn default_path() -> PathBuf {
        match dirs::data_dir() {
            Some(dir) => dir.join("calc-client").join("token"),
            None => PathBuf::from(".calc-token"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileStore {
    fn load(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(s.trim().to_string()).filter(|s| !s.is_empty())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn save(&self, token : &str) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);

        // owner only, the token is a credential
        #[cfg(unix)]
        {
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

            options.mode(0o600);

            // mode only applies on create
            if self.path.exists() {
                fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
            }
        }

        options.open(&self.path)?.write_all(token.as_bytes())
    }

    fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            res => res,
        }
    }
}

/// Non persistent store, the token is gone with the process.
#[derive(Default)]
pub struct MemoryStore {
    token : Mutex<Option<String>>,
}

impl TokenStore for MemoryStore {
    fn load(&self) -> io::Result<Option<String>> {
        Ok(self.token.lock().clone())
    }

    fn save(&self, token : &str) -> io::Result<()> {
        *self.token.lock() = Some(token.to_string());
        Ok(())
    }

    fn remove(&self) -> io::Result<()> {
        self.token.lock().take();
        Ok(())
    }
}

#[derive(Debug)]
pub struct EmptyToken;

/// The client side record of the credential.
///
/// There is exactly one `Session` per logged in front end; it is shared
/// through an `Arc` with the [`Client`](crate::client::Client). The server is
/// the authority on whether the token is valid, the session only tracks
/// whether one is held.
pub struct Session {
    store : Box<dyn TokenStore>,
    token : Mutex<Option<String>>,
    user : Mutex<Option<User>>,
    state : watch::Sender<SessionState>,
}

impl Session {
    pub fn new<S : TokenStore + 'static>(store : S) -> Self {
        let (state, _) = watch::channel(SessionState::Anonymous);

        Self{
            store : Box::new(store),
            token : Mutex::new(None),
            user : Mutex::new(None),
            state,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::default())
    }

    /// Reads the persisted token, if any.
    pub fn restore(&self) -> io::Result<SessionState> {
        let token = self.store.load()?;
        debug!(found = token.is_some(), "restoring session");

        self.user.lock().take();

        let state = match token {
            Some(token) => {
                *self.token.lock() = Some(token);
                SessionState::Authenticated
            },
            None => {
                self.token.lock().take();
                SessionState::Anonymous
            },
        };

        self.transition(state);
        Ok(state)
    }

    pub fn set_token(&self, token : &str) -> Result<(), crate::client::Error> {
        if token.is_empty() {
            return Err(EmptyToken.into())
        }

        self.store.save(token)?;
        *self.token.lock() = Some(token.to_string());
        self.user.lock().take();

        info!("session authenticated");
        self.transition(SessionState::Authenticated);
        Ok(())
    }

    /// Forgets the token and the cached user. Safe to call repeatedly.
    ///
    /// The persisted token goes first. If that fails the error is returned,
    /// but the session is anonymous all the same.
    pub fn clear(&self) -> io::Result<()> {
        let removed = self.store.remove();

        self.token.lock().take();
        self.user.lock().take();

        if self.transition(SessionState::Anonymous) {
            info!("session cleared");
        }

        removed
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// Observers see every transition; the front end uses this to go back to
    /// the login view when a request finds the token rejected.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn user(&self) -> Option<User> {
        self.user.lock().clone()
    }

    pub(crate) fn cache_user(&self, user : User) {
        *self.user.lock() = Some(user);
    }

    fn transition(&self, to : SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == to {
                return false
            }

            *state = to;
            true
        })
    }
}
