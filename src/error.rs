use crate::http::Method;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ServerError {
    IoError(io::Error),
    ParseError(String),
    NotFound,
    MethodNotAllowed(Vec<Method>),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    TooManyRequests,
    UnsatisfiableRange { size: u64 },
    MissingPrimaryKey(&'static str),
    Database { message: String, sql: Option<String> },
    Template(String),
    InternalError(String),
    PanicError(String),
}

impl ServerError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::BadRequest(_) => 400,
            ServerError::Unauthorized(_) => 401,
            ServerError::Forbidden(_) => 403,
            ServerError::NotFound => 404,
            ServerError::MethodNotAllowed(_) => 405,
            ServerError::Conflict(_) => 409,
            ServerError::UnsatisfiableRange { .. } => 416,
            ServerError::ParseError(_) => 422,
            ServerError::TooManyRequests => 429,
            ServerError::Database { .. } => 503,
            ServerError::IoError(_)
            | ServerError::MissingPrimaryKey(_)
            | ServerError::Template(_)
            | ServerError::InternalError(_)
            | ServerError::PanicError(_) => 500,
        }
    }

    /// Message safe to show a client when debug mode is off. Database errors
    /// collapse to a generic phrase so query and schema details never leak.
    pub fn public_message(&self) -> String {
        match self {
            ServerError::Database { .. } => "Service Unavailable".to_string(),
            ServerError::IoError(_)
            | ServerError::InternalError(_)
            | ServerError::PanicError(_)
            | ServerError::Template(_)
            | ServerError::MissingPrimaryKey(_) => "Internal Server Error".to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::IoError(err) => write!(f, "IO error: {}", err),
            ServerError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ServerError::NotFound => write!(f, "Not found"),
            ServerError::MethodNotAllowed(allow) => {
                let allow: Vec<&str> = allow.iter().map(|m| m.as_str()).collect();
                write!(f, "Method not allowed (allow: {})", allow.join(", "))
            }
            ServerError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            ServerError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ServerError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            ServerError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            ServerError::TooManyRequests => write!(f, "Too many requests"),
            ServerError::UnsatisfiableRange { size } => {
                write!(f, "Requested range not satisfiable (size {})", size)
            }
            ServerError::MissingPrimaryKey(table) => {
                write!(f, "Model for table '{}' has no primary key", table)
            }
            ServerError::Database { message, sql } => match sql {
                Some(sql) => write!(f, "Database error: {} (query: {})", message, sql),
                None => write!(f, "Database error: {}", message),
            },
            ServerError::Template(msg) => write!(f, "Template error: {}", msg),
            ServerError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            ServerError::PanicError(msg) => write!(f, "Panic: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        ServerError::IoError(err)
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
