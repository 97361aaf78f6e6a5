//! Staged operations carried by transaction queues.

use serde_json::Value;
use stash_db::{ObjectOwner, ObjectWrite};
use thiserror::Error;

use crate::broker::{Delivery, Headers};

pub const PUT_OBJECT_KIND: &str = "putObject";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("unsupported operation type '{0}'")]
    Unsupported(String),
    #[error("operation is missing a message type")]
    MissingKind,
    #[error("header '{0}' is missing")]
    MissingHeader(&'static str),
    #[error("header '{header}' is invalid: {reason}")]
    InvalidHeader {
        header: &'static str,
        reason: String,
    },
}

/// One unit of work inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedOperation {
    PutObject(PutObjectOperation),
}

impl StagedOperation {
    /// Decodes the message type and headers of a claimed delivery. The body is
    /// left on the delivery so it is not copied.
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, OperationError> {
        match delivery.kind() {
            Some(PUT_OBJECT_KIND) => {
                PutObjectOperation::from_headers(&delivery.headers).map(Self::PutObject)
            }
            Some(other) => Err(OperationError::Unsupported(other.to_string())),
            None => Err(OperationError::MissingKind),
        }
    }
}

/// Upload of a blob under `<prefix>/<name>` plus its index row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObjectOperation {
    pub prefix: String,
    pub name: String,
    pub size: i64,
    pub acl: Option<String>,
    pub authenticated: Option<AuthenticatedOwner>,
}

/// Owner details supplied by authenticated uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedOwner {
    pub user_id: i64,
    pub auth_key: Option<String>,
}

impl PutObjectOperation {
    pub fn from_headers(headers: &Headers) -> Result<Self, OperationError> {
        let prefix = required_str(headers, "S3Prefix")?;
        let name = required_str(headers, "name")?;
        if name.is_empty() {
            return Err(OperationError::InvalidHeader {
                header: "name",
                reason: "must not be empty".into(),
            });
        }

        let size = required_int(headers, "size")?;
        if size < 0 {
            return Err(OperationError::InvalidHeader {
                header: "size",
                reason: format!("negative size {size}"),
            });
        }

        let acl = optional_str(headers, "ACL")?;
        let authenticated = if flag(headers, "authenticated")? {
            Some(AuthenticatedOwner {
                user_id: required_int(headers, "userID")?,
                auth_key: optional_str(headers, "objectAuthkey")?,
            })
        } else {
            None
        };

        Ok(Self {
            prefix,
            name,
            size,
            acl,
            authenticated,
        })
    }

    /// Blob store key for this object.
    pub fn key(&self) -> String {
        format!("{}/{}", self.prefix, self.name)
    }

    /// Index upsert matching this upload.
    pub fn index_write(&self) -> ObjectWrite {
        let owner = match &self.authenticated {
            Some(owner) => ObjectOwner::User {
                user_id: owner.user_id,
                acl: self.acl.clone(),
                auth_key: owner.auth_key.clone(),
            },
            // TODO: the owner is looked up per write; a prefix reassigned between
            // upload and apply lands on the new owner. Needs a decision upstream.
            None => ObjectOwner::Prefix(self.prefix.clone()),
        };

        ObjectWrite {
            owner,
            name: self.name.clone(),
            size: self.size,
        }
    }
}

fn required_str(headers: &Headers, key: &'static str) -> Result<String, OperationError> {
    optional_str(headers, key)?.ok_or(OperationError::MissingHeader(key))
}

fn optional_str(headers: &Headers, key: &'static str) -> Result<Option<String>, OperationError> {
    match headers.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(OperationError::InvalidHeader {
            header: key,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

/// Integers may arrive as numbers or as decimal strings depending on the producer.
fn required_int(headers: &Headers, key: &'static str) -> Result<i64, OperationError> {
    let invalid = |reason: String| OperationError::InvalidHeader { header: key, reason };
    match headers.get(key) {
        None | Some(Value::Null) => Err(OperationError::MissingHeader(key)),
        Some(Value::Number(number)) => number
            .as_i64()
            .ok_or_else(|| invalid(format!("{number} is not an integer"))),
        Some(Value::String(raw)) => raw
            .trim()
            .parse::<i64>()
            .map_err(|err| invalid(format!("'{raw}': {err}"))),
        Some(other) => Err(invalid(format!("expected an integer, got {other}"))),
    }
}

fn flag(headers: &Headers, key: &'static str) -> Result<bool, OperationError> {
    match headers.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(value)) => Ok(*value),
        Some(Value::Number(number)) => Ok(number.as_i64().unwrap_or(0) != 0),
        Some(Value::String(raw)) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            _ => Err(OperationError::InvalidHeader {
                header: key,
                reason: format!("'{raw}' is not a boolean"),
            }),
        },
        Some(other) => Err(OperationError::InvalidHeader {
            header: key,
            reason: format!("expected a boolean, got {other}"),
        }),
    }
}
