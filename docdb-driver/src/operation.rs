//! Logical operations the driver can submit.
//! How an operation is laid out in bytes is the codec's business, not this module's.

use crate::document::Document;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fully qualified collection: `database.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Namespace {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Insert {
        namespace: Namespace,
        documents: Vec<Document>,
    },
    Update {
        namespace: Namespace,
        selector: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    },
    Remove {
        namespace: Namespace,
        selector: Document,
        single: bool,
    },
    Query {
        namespace: Namespace,
        selector: Document,
        skip: u32,
        limit: i32,
    },
    Command {
        database: String,
        command: Document,
    },
}

impl Operation {
    /// The confirmation query sent after a safe write.
    pub fn last_error(database: impl Into<String>) -> Operation {
        Operation::Command {
            database: database.into(),
            command: last_error_command(),
        }
    }

    /// Writes do not produce a reply of their own, everything else does.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Operation::Insert { .. } | Operation::Update { .. } | Operation::Remove { .. }
        )
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Operation::Command { .. })
    }

    pub fn namespace(&self) -> Option<&Namespace> {
        match self {
            Operation::Insert { namespace, .. }
            | Operation::Update { namespace, .. }
            | Operation::Remove { namespace, .. }
            | Operation::Query { namespace, .. } => Some(namespace),
            Operation::Command { .. } => None,
        }
    }

    pub fn database(&self) -> &str {
        match self {
            Operation::Command { database, .. } => database,
            _ => self
                .namespace()
                .map(|namespace| namespace.database.as_str())
                .unwrap_or_default(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Remove { .. } => "remove",
            Operation::Query { .. } => "query",
            Operation::Command { .. } => "command",
        }
    }
}

fn last_error_command() -> Document {
    let mut command = Document::new();
    command.insert("getlasterror".to_owned(), 1.into());
    command
}
