//! An in-process stand-in for the calculator backend.

#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::AUTHORIZATION;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const USERNAME : &str = "alice";
pub const PASSWORD : &str = "secret123";

const CREATED_AT : &str = "2024-03-01T12:00:00.000000";

pub struct Account {
    pub id : i64,
    pub email : String,
    pub password : String,
}

#[derive(Default)]
pub struct State {
    pub accounts : HashMap<String, Account>,
    /// token -> username
    pub tokens : HashMap<String, String>,
    pub calculations : Vec<Value>,
    /// method, path and Authorization header of every request
    pub requests : Vec<(Method, String, Option<String>)>,
    /// every authorized route answers with this status instead
    pub reject_with : Option<StatusCode>,
    /// held before answering any request
    pub delay : Option<Duration>,
    issued : u64,
}

impl State {
    fn user_json(&self, name : &str) -> Value {
        let account = &self.accounts[name];
        json!({
            "id": account.id,
            "username": name,
            "email": account.email,
            "created_at": CREATED_AT,
            "updated_at": CREATED_AT,
        })
    }
}

pub struct MockBackend {
    pub addr : SocketAddr,
    pub state : Arc<Mutex<State>>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let mut state = State::default();
        state.accounts.insert(USERNAME.to_string(), Account{
            id : 1,
            email : "alice@example.com".to_string(),
            password : PASSWORD.to_string(),
        });

        let state = Arc::new(Mutex::new(state));
        let shared = Arc::clone(&state);

        let make_service = make_service_fn(move |_| {
            let state = Arc::clone(&shared);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&state), req)))
            }
        });

        let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_service);
        let addr = server.local_addr();
        tokio::spawn(server);

        Self{ addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Server side invalidation of every issued token.
    pub fn revoke_all(&self) {
        self.state.lock().tokens.clear();
    }

    pub fn reject_all(&self, status : StatusCode) {
        self.state.lock().reject_with = Some(status);
    }

    pub fn delay_responses(&self, delay : Duration) {
        self.state.lock().delay = Some(delay);
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state.lock().requests.last().and_then(|r| r.2.clone())
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }
}

/// An address nothing listens on.
pub fn dead_base_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

async fn handle(
    state : Arc<Mutex<State>>,
    req : Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let auth = req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();

    let delay = state.lock().delay;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let mut state = state.lock();
    state.requests.push((method.clone(), path.clone(), auth.clone()));

    Ok(route(&mut state, &method, &path, &query, auth.as_deref(), &body))
}

fn reply(status : StatusCode, body : Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn detail(status : StatusCode, msg : &str) -> Response<Body> {
    reply(status, json!({ "detail": msg }))
}

fn params(s : &str) -> HashMap<String, String> {
    s.split('&')
        .filter_map(|kv| {
            let mut it = kv.splitn(2, '=');
            let k = it.next()?;
            let v = it.next().unwrap_or("");
            let v = urlencoding::decode(&v.replace('+', " ")).ok()?.into_owned();
            Some((k.to_string(), v))
        })
        .collect()
}

fn route(
    state : &mut State,
    method : &Method,
    path : &str,
    query : &str,
    auth : Option<&str>,
    body : &[u8],
) -> Response<Body> {
    match (method, path) {
        (&Method::POST, "/auth/login") => {
            let form = params(std::str::from_utf8(body).unwrap_or(""));
            let name = form.get("username").cloned().unwrap_or_default();
            let pass = form.get("password").cloned().unwrap_or_default();

            match state.accounts.get(&name) {
                Some(account) if account.password == pass => {
                    state.issued += 1;
                    let token = format!("token-{}", state.issued);
                    state.tokens.insert(token.clone(), name);
                    reply(StatusCode::OK, json!({
                        "access_token": token,
                        "token_type": "bearer",
                    }))
                },
                _ => detail(StatusCode::UNAUTHORIZED, "Incorrect username or password"),
            }
        },
        (&Method::POST, "/auth/register") => {
            let req : Value = match serde_json::from_slice(body) {
                Ok(v) => v,
                Err(_) => return detail(StatusCode::UNPROCESSABLE_ENTITY, "invalid body"),
            };

            let name = req["username"].as_str().unwrap_or("").to_string();
            if state.accounts.contains_key(&name) {
                return detail(StatusCode::BAD_REQUEST, "Username already registered")
            }

            let id = state.accounts.len() as i64 + 1;
            state.accounts.insert(name.clone(), Account{
                id,
                email : req["email"].as_str().unwrap_or("").to_string(),
                password : req["password"].as_str().unwrap_or("").to_string(),
            });

            reply(StatusCode::CREATED, state.user_json(&name))
        },
        _ => {
            if let Some(status) = state.reject_with {
                return detail(status, "Not enough permissions")
            }

            let token = auth.and_then(|h| h.strip_prefix("Bearer "));
            let user = match token {
                None => return detail(StatusCode::UNAUTHORIZED, "Not authenticated"),
                Some(token) => match state.tokens.get(token) {
                    Some(user) => user.clone(),
                    None => return detail(
                        StatusCode::UNAUTHORIZED,
                        "Could not validate credentials",
                    ),
                },
            };

            authorized_route(state, method, path, query, token.unwrap_or(""), &user, body)
        },
    }
}

fn calculate(op : &str, a : f64, b : f64) -> Result<f64, &'static str> {
    match op {
        "add" => Ok(a + b),
        "subtract" => Ok(a - b),
        "multiply" => Ok(a * b),
        "divide" if b == 0.0 => Err("Value error, Cannot divide by zero"),
        "divide" => Ok(a / b),
        "power" => Ok(a.powf(b)),
        "modulus" if b == 0.0 => Err("Value error, Cannot calculate modulus with zero divisor"),
        "modulus" => Ok(a % b),
        _ => Err("Input should be 'add', 'subtract', 'multiply', 'divide', 'power' or 'modulus'"),
    }
}

fn authorized_route(
    state : &mut State,
    method : &Method,
    path : &str,
    query : &str,
    token : &str,
    user : &str,
    body : &[u8],
) -> Response<Body> {
    let user_id = state.accounts[user].id;

    match (method, path) {
        (&Method::POST, "/auth/logout") => {
            state.tokens.remove(token);
            reply(StatusCode::OK, json!({ "message": "Successfully logged out" }))
        },
        (&Method::GET, "/auth/me") | (&Method::GET, "/users/profile") => {
            reply(StatusCode::OK, state.user_json(user))
        },
        (&Method::PUT, "/users/profile") => {
            let req : Value = serde_json::from_slice(body).unwrap_or(Value::Null);
            let mut name = user.to_string();

            if let Some(new_name) = req["username"].as_str() {
                if new_name != user && state.accounts.contains_key(new_name) {
                    return detail(StatusCode::BAD_REQUEST, "Username already taken")
                }

                if let Some(account) = state.accounts.remove(user) {
                    state.accounts.insert(new_name.to_string(), account);
                }
                for owner in state.tokens.values_mut() {
                    if owner.as_str() == user {
                        *owner = new_name.to_string();
                    }
                }
                name = new_name.to_string();
            }

            if let Some(email) = req["email"].as_str() {
                if let Some(account) = state.accounts.get_mut(&name) {
                    account.email = email.to_string();
                }
            }

            reply(StatusCode::OK, state.user_json(&name))
        },
        (&Method::POST, "/users/change-password") => {
            let req : Value = serde_json::from_slice(body).unwrap_or(Value::Null);
            let account = match state.accounts.get_mut(user) {
                Some(account) => account,
                None => return detail(StatusCode::NOT_FOUND, "User not found"),
            };

            if req["current_password"].as_str() != Some(account.password.as_str()) {
                return detail(StatusCode::BAD_REQUEST, "Current password is incorrect")
            }

            account.password = req["new_password"].as_str().unwrap_or("").to_string();
            reply(StatusCode::OK, json!({ "message": "Password changed successfully" }))
        },
        (&Method::DELETE, "/users/profile") => {
            state.accounts.remove(user);
            state.tokens.retain(|_, owner| owner.as_str() != user);
            state.calculations.retain(|c| c["user_id"] != json!(user_id));

            Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Body::empty())
                .unwrap()
        },
        (&Method::POST, "/calculations/") => {
            let req : Value = serde_json::from_slice(body).unwrap_or(Value::Null);
            let op = req["operation"].as_str().unwrap_or("");
            let a = req["operand1"].as_f64().unwrap_or(0.0);
            let b = req["operand2"].as_f64().unwrap_or(0.0);

            let result = match calculate(op, a, b) {
                Ok(result) => result,
                Err(msg) => return reply(StatusCode::UNPROCESSABLE_ENTITY, json!({
                    "detail": [{
                        "type": "value_error",
                        "loc": ["body", "operand2"],
                        "msg": msg,
                    }]
                })),
            };

            let id = state.calculations.len() as i64 + 1;
            state.calculations.push(json!({
                "id": id,
                "user_id": user_id,
                "operation": op,
                "operand1": a,
                "operand2": b,
                "result": result,
                "created_at": CREATED_AT,
            }));

            reply(StatusCode::CREATED, json!({
                "operation": op,
                "operand1": a,
                "operand2": b,
                "result": result,
                "message": "Calculation completed and saved successfully",
            }))
        },
        (&Method::GET, "/calculations/") => {
            let q = params(query);
            let skip : usize = q.get("skip").and_then(|s| s.parse().ok()).unwrap_or(0);
            let limit : usize = q.get("limit").and_then(|s| s.parse().ok()).unwrap_or(100);

            let items : Vec<Value> = own(state, user_id)
                .skip(skip)
                .take(limit)
                .cloned()
                .collect();

            reply(StatusCode::OK, Value::Array(items))
        },
        (&Method::GET, "/analytics/summary") => {
            let mine : Vec<&Value> = own(state, user_id).collect();
            let total = mine.len();

            let mut counts : Vec<(String, u64)> = Vec::new();
            for c in mine.iter() {
                let op = c["operation"].as_str().unwrap_or("").to_string();
                match counts.iter_mut().find(|(o, _)| *o == op) {
                    Some((_, n)) => *n += 1,
                    None => counts.push((op, 1)),
                }
            }

            let breakdown : Vec<Value> = counts.iter()
                .map(|(op, n)| json!({
                    "operation": op,
                    "count": n,
                    "percentage": (*n as f64) * 100.0 / (total as f64),
                }))
                .collect();

            let most_used = counts.iter().max_by_key(|(_, n)| *n).map(|(op, _)| op.clone());
            let latest = if total == 0 { None } else { Some(CREATED_AT) };
            let average = if total == 0 {
                None
            } else {
                Some(mine.iter().filter_map(|c| c["result"].as_f64()).sum::<f64>() / total as f64)
            };

            reply(StatusCode::OK, json!({
                "total_calculations": total,
                "total_users": 1,
                "operations_breakdown": breakdown,
                "most_used_operation": most_used,
                "average_result": average,
                "latest_calculation": latest,
            }))
        },
        (&Method::GET, "/analytics/history") => {
            let q = params(query);
            let limit : usize = q.get("limit").and_then(|s| s.parse().ok()).unwrap_or(10);
            let offset : usize = q.get("offset").and_then(|s| s.parse().ok()).unwrap_or(0);
            let op = q.get("operation").cloned();

            let matching : Vec<&Value> = own(state, user_id)
                .filter(|c| match &op {
                    Some(op) => c["operation"].as_str() == Some(op.as_str()),
                    None => true,
                })
                .collect();

            let total = matching.len();
            let has_more = offset + limit < total;
            let items : Vec<Value> = matching.into_iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect();

            reply(StatusCode::OK, json!({
                "items": items,
                "total": total,
                "limit": limit,
                "offset": offset,
                "has_more": has_more,
            }))
        },
        (&Method::DELETE, "/analytics/history") => {
            let before = state.calculations.len();
            state.calculations.retain(|c| c["user_id"] != json!(user_id));

            reply(StatusCode::OK, json!({
                "message": "Calculation history cleared successfully",
                "deleted_count": before - state.calculations.len(),
            }))
        },
        (m, p) if p.starts_with("/calculations/") => {
            let id : i64 = match p["/calculations/".len()..].parse() {
                Ok(id) => id,
                Err(_) => return detail(StatusCode::NOT_FOUND, "Not Found"),
            };

            let pos = state.calculations.iter().position(|c| {
                c["id"] == json!(id) && c["user_id"] == json!(user_id)
            });

            match (m, pos) {
                (_, None) => detail(StatusCode::NOT_FOUND, "Calculation not found"),
                (&Method::GET, Some(pos)) => reply(StatusCode::OK, state.calculations[pos].clone()),
                (&Method::DELETE, Some(pos)) => {
                    state.calculations.remove(pos);
                    Response::builder()
                        .status(StatusCode::NO_CONTENT)
                        .body(Body::empty())
                        .unwrap()
                },
                (&Method::PUT, Some(pos)) => {
                    let req : Value = serde_json::from_slice(body).unwrap_or(Value::Null);
                    let calc = &mut state.calculations[pos];

                    for key in ["operation", "operand1", "operand2"].iter() {
                        if !req[*key].is_null() {
                            calc[*key] = req[*key].clone();
                        }
                    }

                    let op = calc["operation"].as_str().unwrap_or("").to_string();
                    let a = calc["operand1"].as_f64().unwrap_or(0.0);
                    let b = calc["operand2"].as_f64().unwrap_or(0.0);
                    match calculate(&op, a, b) {
                        Ok(result) => {
                            calc["result"] = json!(result);
                            reply(StatusCode::OK, calc.clone())
                        },
                        Err(msg) => detail(StatusCode::BAD_REQUEST, msg),
                    }
                },
                _ => detail(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
            }
        },
        _ => detail(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn own<'a>(state : &'a State, user_id : i64) -> impl Iterator<Item = &'a Value> + 'a {
    state.calculations.iter().filter(move |c| c["user_id"] == json!(user_id))
}
