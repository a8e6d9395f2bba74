use crate::DbError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the worker loop reacts to a database error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Serialization or conflict failure: roll back and try again.
    Retryable,
    /// The workload references a table or collection that does not exist. Aborts the run.
    MissingSchemaObject,
    /// Anything else. Fatal to the current connection.
    Fatal,
}

/// Database family a backend belongs to. Decides how native errors are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendFamily {
    Postgres,
    Mysql,
    Maria,
    Oracle,
    Mongo,
    Other,
}

impl BackendFamily {
    pub fn classify(&self, err: &DbError) -> ErrorClass {
        let code = err.code.as_deref();
        match self {
            BackendFamily::Postgres => match code {
                Some("40001") => ErrorClass::Retryable,
                Some("42P01") => ErrorClass::MissingSchemaObject,
                _ => ErrorClass::Fatal,
            },
            BackendFamily::Mysql => match code {
                Some("1213") => ErrorClass::Retryable,
                Some("1146") => ErrorClass::MissingSchemaObject,
                _ => ErrorClass::Fatal,
            },
            BackendFamily::Maria => match code {
                Some("1213") => ErrorClass::Retryable,
                _ if err.message.ends_with(" doesn't exist") => ErrorClass::MissingSchemaObject,
                _ => ErrorClass::Fatal,
            },
            BackendFamily::Oracle => {
                if code == Some("ORA-08177") || err.message.starts_with("ORA-08177") {
                    ErrorClass::Retryable
                } else if code == Some("ORA-00942") || err.message.starts_with("ORA-00942") {
                    ErrorClass::MissingSchemaObject
                } else {
                    ErrorClass::Fatal
                }
            }
            BackendFamily::Mongo | BackendFamily::Other => ErrorClass::Fatal,
        }
    }

    /// Whether a fatal error outside a transaction is survivable by reconnecting.
    pub fn reconnects(&self) -> bool {
        !matches!(self, BackendFamily::Mongo | BackendFamily::Other)
    }

    /// Best guess from a connection URI scheme, e.g. `postgres://…`.
    pub fn from_uri(uri: &str) -> Option<Self> {
        let (scheme, _) = uri.split_once("://")?;
        let scheme = scheme.split('+').next().unwrap_or(scheme);
        scheme.parse().ok()
    }
}

impl FromStr for BackendFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "cockroach" | "cockroachdb" | "crdb" => {
                Ok(BackendFamily::Postgres)
            }
            "mysql" => Ok(BackendFamily::Mysql),
            "maria" | "mariadb" => Ok(BackendFamily::Maria),
            "oracle" => Ok(BackendFamily::Oracle),
            "mongo" | "mongodb" | "mongodb+srv" => Ok(BackendFamily::Mongo),
            "other" => Ok(BackendFamily::Other),
            other => Err(format!("Unknown backend family '{other}'")),
        }
    }
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendFamily::Postgres => "postgres",
            BackendFamily::Mysql => "mysql",
            BackendFamily::Maria => "maria",
            BackendFamily::Oracle => "oracle",
            BackendFamily::Mongo => "mongo",
            BackendFamily::Other => "other",
        };
        f.write_str(name)
    }
}
