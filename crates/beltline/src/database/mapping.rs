/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Names of the database objects that make up one queue.
//!
//! Every table, sequence, function and the notification channel is derived
//! from a single prefix (and an optional schema), so several independent
//! queues can live in the same database. Names end up spliced into SQL text,
//! which is why both parts are validated against PostgreSQL identifier rules
//! before a [`QueueMapping`] can be built.

use thiserror::Error;

/// Maximum length for PostgreSQL identifiers (NAMEDATALEN - 1).
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Longest suffix appended to the prefix (`_task_lock_handle_seq`).
const LONGEST_SUFFIX: usize = 21;

const RESERVED_SCHEMA_NAMES: &[&str] = &["pg_catalog", "information_schema", "pg_temp", "pg_toast"];

pub const DEFAULT_PREFIX: &str = "beltline";

/// Errors produced while validating object names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("Identifier length invalid: '{name}' (must be 1-{max} characters)")]
    InvalidLength { name: String, max: usize },

    #[error("Identifier must start with a lowercase letter or underscore: '{0}'")]
    InvalidStart(String),

    /// Only lowercase letters, digits and underscores are accepted so that
    /// names never need quoting.
    #[error("Identifier contains invalid characters (only a-z, 0-9 and _ allowed): '{0}'")]
    InvalidCharacters(String),

    #[error("Schema name is reserved: '{0}'")]
    ReservedName(String),
}

/// Validates an unquoted PostgreSQL identifier of at most `max` characters.
pub fn validate_identifier(name: &str, max: usize) -> Result<&str, IdentifierError> {
    let Some(first) = name.chars().next() else {
        return Err(IdentifierError::InvalidLength {
            name: name.to_string(),
            max,
        });
    };
    if name.len() > max {
        return Err(IdentifierError::InvalidLength {
            name: name.to_string(),
            max,
        });
    }

    if !first.is_ascii_lowercase() && first != '_' {
        return Err(IdentifierError::InvalidStart(name.to_string()));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(IdentifierError::InvalidCharacters(name.to_string()));
    }

    Ok(name)
}

/// Validates a schema name, additionally rejecting system schemas.
pub fn validate_schema_name(name: &str) -> Result<&str, IdentifierError> {
    validate_identifier(name, MAX_IDENTIFIER_LENGTH)?;
    if RESERVED_SCHEMA_NAMES.contains(&name) || name.starts_with("pg_") {
        return Err(IdentifierError::ReservedName(name.to_string()));
    }
    Ok(name)
}

/// Object names for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMapping {
    prefix: String,
    schema: Option<String>,
}

impl Default for QueueMapping {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            schema: None,
        }
    }
}

impl QueueMapping {
    pub fn new(prefix: &str, schema: Option<&str>) -> Result<Self, IdentifierError> {
        let prefix = validate_identifier(prefix, MAX_IDENTIFIER_LENGTH - LONGEST_SUFFIX)?;
        let schema = schema.map(validate_schema_name).transpose()?;

        Ok(Self {
            prefix: prefix.to_string(),
            schema: schema.map(str::to_string),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    fn qualified(&self, name: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}_{}", schema, self.prefix, name),
            None => format!("{}_{}", self.prefix, name),
        }
    }

    pub fn tasks_table(&self) -> String {
        self.qualified("tasks")
    }

    pub fn results_table(&self) -> String {
        self.qualified("task_results")
    }

    pub fn time_table(&self) -> String {
        self.qualified("time")
    }

    pub fn migrations_table(&self) -> String {
        self.qualified("migrations")
    }

    pub fn lock_handle_sequence(&self) -> String {
        self.qualified("task_lock_handle_seq")
    }

    pub fn dequeue_function(&self) -> String {
        self.qualified("try_dequeue_task")
    }

    pub fn has_lock_function(&self) -> String {
        self.qualified("has_advisory_lock")
    }

    /// Notification channel; channels are not schema-scoped, so the schema
    /// is folded into the name instead.
    pub fn notification_channel(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}_{}_task_posted", schema, self.prefix),
            None => format!("{}_task_posted", self.prefix),
        }
    }

    /// Substitutes object-name placeholders in a SQL template.
    pub fn render(&self, template: &str) -> String {
        let schema_prefix = self
            .schema
            .as_ref()
            .map(|s| format!("{}.", s))
            .unwrap_or_default();

        template
            .replace("{tasks}", &self.tasks_table())
            .replace("{results}", &self.results_table())
            .replace("{time}", &self.time_table())
            .replace("{migrations}", &self.migrations_table())
            .replace("{lock_seq}", &self.lock_handle_sequence())
            .replace("{dequeue_fn}", &self.dequeue_function())
            .replace("{has_lock_fn}", &self.has_lock_function())
            .replace("{channel}", &self.notification_channel())
            .replace("{schema.}", &schema_prefix)
            .replace("{prefix}", &self.prefix)
    }
}
