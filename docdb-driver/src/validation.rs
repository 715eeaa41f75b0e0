//! Pre-flight checks on collection names and document keys.
//! A request that fails here is never registered and never sent.

use crate::document::Document;
use crate::error::ValidationError;
use crate::operation::Operation;
use serde::Deserialize;
use serde_json::Value;

/// Where update modifiers such as `$set` are allowed to use keys starting with `$`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierExemption {
    /// Only the modifier names themselves are exempt, their operands are checked like any other document.
    #[default]
    TopLevel,
    /// Modifier names and everything inside their operands are exempt.
    Recursive,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionValidator {
    pub modifier_exemption: ModifierExemption,
}

impl AdmissionValidator {
    pub fn new(modifier_exemption: ModifierExemption) -> Self {
        AdmissionValidator { modifier_exemption }
    }

    /// Validates a collection name supplied as an arbitrary value, anything other than a string is rejected.
    pub fn validate_name_value(&self, name: &Value) -> Result<(), ValidationError> {
        match name {
            Value::String(name) => self.validate_name(name),
            _ => Err(ValidationError::WrongType),
        }
    }

    pub fn validate_name(&self, name: &str) -> Result<(), ValidationError> {
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if name.contains('$') {
            return Err(ValidationError::ContainsDollar);
        }
        if name.starts_with('.') || name.ends_with('.') {
            return Err(ValidationError::BoundaryDot);
        }
        if name.split('.').any(str::is_empty) {
            return Err(ValidationError::EmptyName);
        }
        Ok(())
    }

    /// Checks every key at every depth, including documents nested in arrays.
    pub fn validate_keys(&self, document: &Document) -> Result<(), ValidationError> {
        for (key, value) in document {
            check_key(key)?;
            check_value(value)?;
        }
        Ok(())
    }

    /// Checks an update document.
    ///
    /// A document whose keys start with `$` is a modifier document and its top level keys are exempt from the `$` rule.
    /// Whether the operands of those modifiers are checked depends on [`ModifierExemption`].
    /// A replacement document, one without any modifiers, is checked like any other document.
    pub fn validate_update(&self, update: &Document) -> Result<(), ValidationError> {
        if !is_modifier_document(update) {
            return self.validate_keys(update);
        }
        for (key, operand) in update {
            if !key.starts_with('$') {
                check_key(key)?;
                check_value(operand)?;
            } else if self.modifier_exemption == ModifierExemption::TopLevel {
                if key.contains('.') {
                    return Err(ValidationError::KeyContainsDot(key.clone()));
                }
                check_value(operand)?;
            }
        }
        Ok(())
    }

    /// Run every check that applies to `operation`.
    pub fn validate_operation(&self, operation: &Operation) -> Result<(), ValidationError> {
        if let Some(namespace) = operation.namespace() {
            self.validate_name(&namespace.collection)?;
        }
        match operation {
            Operation::Insert { documents, .. } => documents
                .iter()
                .try_for_each(|document| self.validate_keys(document)),
            Operation::Update { update, .. } => self.validate_update(update),
            // selectors and commands are built from operators, their keys are not stored
            Operation::Remove { .. } | Operation::Query { .. } | Operation::Command { .. } => Ok(()),
        }
    }
}

fn is_modifier_document(document: &Document) -> bool {
    document.keys().next().is_some_and(|key| key.starts_with('$'))
}

fn check_key(key: &str) -> Result<(), ValidationError> {
    if key.starts_with('$') {
        Err(ValidationError::KeyStartsWithDollar(key.to_owned()))
    } else if key.contains('.') {
        Err(ValidationError::KeyContainsDot(key.to_owned()))
    } else {
        Ok(())
    }
}

fn check_value(value: &Value) -> Result<(), ValidationError> {
    match value {
        Value::Object(document) => {
            for (key, value) in document {
                check_key(key)?;
                check_value(value)?;
            }
            Ok(())
        }
        Value::Array(values) => values.iter().try_for_each(check_value),
        _ => Ok(()),
    }
}
