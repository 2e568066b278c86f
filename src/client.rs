use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::client::connect::Connect;
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Method, Request, StatusCode, Uri};
use quick_from::QuickFrom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{
    AnalyticsSummary, Calculation, CalculationResult, CalculationUpdate,
    HistoryFilter, HistoryPage, NewUser, Operation, ProfileUpdate, User,
};
use crate::session::{EmptyToken, FileStore, Session, SessionState};
use crate::{
    DeleteHistoryResponse, MessageResponse, PostCalculationRequest,
    PostChangePasswordRequest, PostLoginResponse,
};


type Result<T> = std::result::Result<T, Error>;

pub const DEFAULT_BASE_URL : &str = "http://localhost:8000";

#[derive(Debug, QuickFrom)]
pub enum Error {
    /// The server rejected the credential. The session has been cleared and
    /// the user has to log in again.
    Unauthorized,

    /// Any other non 2xx response, with the server's message if it sent one.
    RequestFailed(StatusCode, Option<String>),

    /// No response was received.
    #[quick_from]
    Network(hyper::Error),

    #[quick_from]
    SerdeJson(serde_json::Error),

    #[quick_from]
    Http(hyper::http::Error),

    #[quick_from]
    InvalidUri(hyper::http::uri::InvalidUri),

    #[quick_from]
    Io(io::Error),

    #[quick_from]
    EmptyToken(EmptyToken),
}

impl Error {
    /// The message to show the user, if the server gave one.
    pub fn message(&self) -> Option<&str> {
        match self {
            Error::RequestFailed(_, msg) => msg.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f : &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;

        match self {
            Unauthorized => f.write_str("session expired, please log in again"),
            RequestFailed(_, Some(msg)) => f.write_str(msg),
            RequestFailed(status, None) => write!(f, "request failed ({})", status),
            Network(err) => write!(f, "network error: {}", err),
            SerdeJson(err) => write!(f, "unexpected response: {}", err),
            Http(err) => write!(f, "invalid request: {}", err),
            InvalidUri(err) => write!(f, "invalid url: {}", err),
            Io(err) => write!(f, "token storage: {}", err),
            EmptyToken(_) => f.write_str("server issued an empty token"),
        }
    }
}

impl std::error::Error for Error {}


/// Builds `RequestFailed` from an error body.
///
/// The backend sends `{"detail": "..."}` for domain errors and
/// `{"detail": [{"msg": "..."}, ...]}` for validation errors; `{"error": ...}`
/// is accepted too.
fn parse_error(status : StatusCode, body : &[u8]) -> Error {

    #[derive(Deserialize)]
    struct Violation {
        msg : String,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Detail {
        Message(String),
        Violations(Vec<Violation>),
        Other(serde_json::Value),
    }

    #[derive(Deserialize)]
    struct E {
        detail : Option<Detail>,
        error : Option<String>,
    }

    let message = match serde_json::from_slice::<E>(body) {
        Ok(E{ detail : Some(Detail::Message(msg)), .. }) => Some(msg),
        Ok(E{ detail : Some(Detail::Violations(v)), .. }) if !v.is_empty() => Some(
            v.into_iter()
                .map(|v| v.msg)
                .collect::<Vec<_>>()
                .join("; ")
        ),
        Ok(E{ error, .. }) => error,
        Err(_) => None,
    };

    Error::RequestFailed(status, message)
}

fn decode<T : DeserializeOwned>(status : StatusCode, body : &[u8]) -> Result<T> {
    if !status.is_success() {
        return Err(parse_error(status, body))
    }

    // 204 and friends
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_slice(b"null")?)
    }

    Ok(serde_json::from_slice(body)?)
}


#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_base_url")]
    pub base_url : String,

    /// Where the token is persisted, defaults to the platform data dir.
    #[serde(default)]
    pub token_file : Option<String>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self{
            base_url : default_base_url(),
            token_file : None,
        }
    }
}

impl Config {
    pub fn from_json(s : &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Reads `CALC_CONFIG` (default `config.json`). A missing file means
    /// defaults; `CALC_BASE_URL` overrides the base url either way.
    pub fn from_env() -> Result<Self> {
        let file = std::env::var("CALC_CONFIG").unwrap_or("config.json".to_string());
        Self::load(&file, std::env::var("CALC_BASE_URL").ok())
    }

    /// Reads `file`, falling back to defaults when it does not exist.
    pub fn load(file : &str, base_url : Option<String>) -> Result<Self> {
        let mut config = match std::fs::read_to_string(file) {
            Ok(s) => Self::from_json(&s)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(file = %file, "no config file, using defaults");
                Self::default()
            },
            Err(err) => return Err(err.into()),
        };

        if let Some(base_url) = base_url {
            config.base_url = base_url;
        }

        Ok(config)
    }
}

impl TryFrom<Config> for Client {
    type Error = Error;

    fn try_from(
        config : Config,
    ) -> Result<Self> {
        let store = match config.token_file {
            Some(path) => FileStore::new(path),
            None => FileStore::new(FileStore::default_path()),
        };

        Client::new(&config.base_url, Arc::new(Session::new(store)))
    }
}


/// Talks to the calculator backend on behalf of a [`Session`].
///
/// Requests are independent: two calls in flight may complete in either
/// order, and nothing is retried.
pub struct Client<C = HttpConnector> {
    base : String,
    session : Arc<Session>,
    client : hyper::Client<C>,
}

impl Client {
    pub fn new(base_url : &str, session : Arc<Session>) -> Result<Self> {
        Self::with_connector(base_url, session, HttpConnector::new())
    }
}

impl<C> Client<C>
where
    C : Connect + Clone + Send + Sync + 'static,
{
    /// Use a custom connector, e.g. one that speaks TLS.
    pub fn with_connector(
        base_url : &str,
        session : Arc<Session>,
        connector : C,
    ) -> Result<Self> {
        // validate once so request building only fails on bad paths
        let _ : Uri = base_url.parse()?;

        Ok(Client{
            base : base_url.trim_end_matches('/').to_string(),
            session,
            client : hyper::Client::builder().build(connector),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    async fn send(
        &self,
        method : Method,
        path : &str,
        token : Option<&str>,
        content : Option<(&'static str, Vec<u8>)>,
    ) -> Result<(StatusCode, Bytes)> {
        let uri : Uri = format!("{}{}", self.base, path).parse()?;

        let mut req = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header(ACCEPT, "application/json");

        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let req = match content {
            Some((content_type, body)) => req
                .header(CONTENT_TYPE, content_type)
                .body(Body::from(body))?,
            None => req.body(Body::empty())?,
        };

        let start = Instant::now();

        let res = match self.client.request(req).await {
            Ok(res) => res,
            Err(err) => {
                warn!(method = %method, path, error = %err, "no response");
                return Err(err.into())
            },
        };

        let (parts, body) = res.into_parts();
        let body = hyper::body::to_bytes(body).await?;

        debug!(
            status = %parts.status,
            method = %method,
            path,
            elapsed = ?start.elapsed(),
            "request"
        );

        Ok((parts.status, body))
    }

    /// Sends a request carrying the session's bearer token.
    ///
    /// Callers are expected to hold a token; when there is none the header is
    /// left out and the server decides. A 401 or 403 clears the session.
    pub async fn authorized_request<T, B>(
        &self,
        method : Method,
        path : &str,
        body : Option<&B>,
    ) -> Result<T>
    where
        T : DeserializeOwned,
        B : Serialize + ?Sized,
    {
        let token = self.session.token();
        if token.is_none() {
            warn!(method = %method, path, "authorized request without a session");
        }

        let content = match body {
            Some(body) => Some(("application/json", serde_json::to_vec(body)?)),
            None => None,
        };

        let (status, body) = self.send(method, path, token.as_deref(), content).await?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            if let Err(err) = self.session.clear() {
                warn!(error = %err, "could not remove persisted token");
            }

            return Err(Error::Unauthorized)
        }

        decode(status, &body)
    }

    async fn get<T : DeserializeOwned>(&self, path : &str) -> Result<T> {
        self.authorized_request::<T, ()>(Method::GET, path, None).await
    }

    async fn delete<T : DeserializeOwned>(&self, path : &str) -> Result<T> {
        self.authorized_request::<T, ()>(Method::DELETE, path, None).await
    }

    async fn json<T, B>(&self, method : Method, path : &str, body : &B) -> Result<T>
    where
        T : DeserializeOwned,
        B : Serialize + ?Sized,
    {
        self.authorized_request(method, path, Some(body)).await
    }

    /// Exchanges credentials for a token and loads the user.
    pub async fn login(&self, username : &str, password : &str) -> Result<User> {
        let form = format!(
            "username={}&password={}",
            urlencoding::encode(username),
            urlencoding::encode(password),
        );

        let (status, body) = self.send(
            Method::POST,
            "/auth/login",
            None,
            Some(("application/x-www-form-urlencoded", form.into_bytes())),
        ).await?;

        // a 401 here means bad credentials, the session is not involved
        let res : PostLoginResponse = decode(status, &body)?;
        self.session.set_token(&res.access_token)?;

        self.current_user().await
    }

    /// Creates an account. Does not log in.
    pub async fn register(&self, user : &NewUser) -> Result<User> {
        let (status, body) = self.send(
            Method::POST,
            "/auth/register",
            None,
            Some(("application/json", serde_json::to_vec(user)?)),
        ).await?;

        decode(status, &body)
    }

    /// Invalidates the token server side if possible, and always forgets it
    /// locally.
    pub async fn logout(&self) -> Result<()> {
        if self.session.token().is_some() {
            let res = self.authorized_request::<serde_json::Value, ()>(
                Method::POST,
                "/auth/logout",
                None,
            ).await;

            if let Err(err) = res {
                warn!(error = %err, "server side logout failed");
            }
        }

        Ok(self.session.clear()?)
    }

    /// The logged in user, fetched once per session.
    pub async fn current_user(&self) -> Result<User> {
        if let Some(user) = self.session.user() {
            return Ok(user)
        }

        let user : User = self.get("/auth/me").await?;
        self.session.cache_user(user.clone());
        Ok(user)
    }

    /// Start up: restore the persisted token and check it against the server.
    ///
    /// A rejected token leaves the session anonymous. Other failures are
    /// returned and the session is left as restored.
    pub async fn resume(&self) -> Result<SessionState> {
        if self.session.restore()? == SessionState::Anonymous {
            return Ok(SessionState::Anonymous)
        }

        match self.current_user().await {
            Ok(_) => Ok(SessionState::Authenticated),
            Err(Error::Unauthorized) => Ok(SessionState::Anonymous),
            Err(err) => Err(err),
        }
    }

    pub async fn calculate(
        &self,
        operation : Operation,
        operand1 : f64,
        operand2 : f64,
    ) -> Result<CalculationResult> {
        self.json(Method::POST, "/calculations/", &PostCalculationRequest{
            operation,
            operand1,
            operand2,
        }).await
    }

    pub async fn calculations(&self, skip : u64, limit : u64) -> Result<Vec<Calculation>> {
        self.get(&format!("/calculations/?skip={}&limit={}", skip, limit)).await
    }

    pub async fn calculation(&self, id : i64) -> Result<Calculation> {
        self.get(&format!("/calculations/{}", id)).await
    }

    pub async fn update_calculation(
        &self,
        id : i64,
        update : &CalculationUpdate,
    ) -> Result<Calculation> {
        self.json(Method::PUT, &format!("/calculations/{}", id), update).await
    }

    pub async fn delete_calculation(&self, id : i64) -> Result<()> {
        self.delete(&format!("/calculations/{}", id)).await
    }

    pub async fn summary(&self) -> Result<AnalyticsSummary> {
        self.get("/analytics/summary").await
    }

    pub async fn history(&self, filter : &HistoryFilter) -> Result<HistoryPage> {
        self.get(&format!("/analytics/history?{}", filter.to_query())).await
    }

    /// Returns the number of deleted calculations.
    pub async fn clear_history(&self) -> Result<u64> {
        let res : DeleteHistoryResponse = self.delete("/analytics/history").await?;
        Ok(res.deleted_count)
    }

    pub async fn profile(&self) -> Result<User> {
        let user : User = self.get("/users/profile").await?;
        self.session.cache_user(user.clone());
        Ok(user)
    }

    pub async fn update_profile(&self, update : &ProfileUpdate) -> Result<User> {
        let user : User = self.json(Method::PUT, "/users/profile", update).await?;
        self.session.cache_user(user.clone());
        Ok(user)
    }

    pub async fn change_password(
        &self,
        current_password : &str,
        new_password : &str,
    ) -> Result<String> {
        let res : MessageResponse = self.json(
            Method::POST,
            "/users/change-password",
            &PostChangePasswordRequest{
                current_password : current_password.to_string(),
                new_password : new_password.to_string(),
            },
        ).await?;

        Ok(res.message)
    }

    /// Deletes the account; the session ends with it.
    pub async fn delete_account(&self) -> Result<()> {
        self.delete::<()>("/users/profile").await?;
        Ok(self.session.clear()?)
    }
}
