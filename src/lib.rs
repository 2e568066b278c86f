use serde::{Serialize,Deserialize};

pub mod models;
pub mod session;
pub mod client;

pub use client::{Client, Config, Error};
pub use session::{Session, SessionState};

use models::Operation;


#[derive(Serialize,Deserialize)]
pub struct PostLoginResponse {
    pub access_token : String,
    #[serde(default = "bearer")]
    pub token_type : String,
}

fn bearer() -> String {
    "bearer".to_string()
}

#[derive(Serialize,Deserialize)]
pub struct PostCalculationRequest {
    pub operation : Operation,
    pub operand1 : f64,
    pub operand2 : f64,
}

#[derive(Serialize,Deserialize)]
pub struct PostChangePasswordRequest {
    pub current_password : String,
    pub new_password : String,
}

#[derive(Debug,Serialize,Deserialize)]
pub struct MessageResponse {
    pub message : String,
}

#[derive(Debug,Serialize,Deserialize)]
pub struct DeleteHistoryResponse {
    pub message : String,
    pub deleted_count : u64,
}
