//! Auth table loaders.
//!
//! Both loaders produce the same CSV shape: a header row starting with
//! `username,password` followed by attribute column names, then one row per
//! user. Blank lines and lines starting with `#` are ignored.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use super::{AuthError, AuthUserRecord};

/// Loads the full set of auth records in one batch.
#[async_trait]
pub trait AuthUserLoader: Send + Sync {
    async fn load_auth_users(&self) -> Result<Vec<AuthUserRecord>, AuthError>;
}

/// Reads records from a CSV file.
#[derive(Debug, Clone)]
pub struct CsvAuthUserLoader {
    pub path: PathBuf,
}

#[async_trait]
impl AuthUserLoader for CsvAuthUserLoader {
    async fn load_auth_users(&self) -> Result<Vec<AuthUserRecord>, AuthError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AuthError::Load(format!("read {}: {}", self.path.display(), e)))?;
        parse_auth_table(&text)
    }
}

/// Runs a shell command and parses its stdout.
#[derive(Debug, Clone)]
pub struct CommandAuthUserLoader {
    pub command: String,
}

#[async_trait]
impl AuthUserLoader for CommandAuthUserLoader {
    async fn load_auth_users(&self) -> Result<Vec<AuthUserRecord>, AuthError> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AuthError::Load(format!("spawn {:?}: {}", self.command, e)))?;

        if !output.status.success() {
            return Err(AuthError::Load(format!(
                "command {:?} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let text = String::from_utf8(output.stdout)
            .map_err(|e| AuthError::Load(format!("command {:?} output: {}", self.command, e)))?;
        parse_auth_table(&text)
    }
}

/// Loader chosen from the `auth_table` setting.
#[derive(Debug, Clone)]
pub enum AuthTableLoader {
    Csv(CsvAuthUserLoader),
    Command(CommandAuthUserLoader),
}

impl AuthTableLoader {
    /// A `.csv` suffix selects the file loader, anything else is a command.
    pub fn from_setting(table: &str) -> Self {
        if table.ends_with(".csv") {
            AuthTableLoader::Csv(CsvAuthUserLoader {
                path: PathBuf::from(table),
            })
        } else {
            AuthTableLoader::Command(CommandAuthUserLoader {
                command: table.to_string(),
            })
        }
    }
}

#[async_trait]
impl AuthUserLoader for AuthTableLoader {
    async fn load_auth_users(&self) -> Result<Vec<AuthUserRecord>, AuthError> {
        match self {
            AuthTableLoader::Csv(loader) => loader.load_auth_users().await,
            AuthTableLoader::Command(loader) => loader.load_auth_users().await,
        }
    }
}

/// Parse auth table text into records.
pub fn parse_auth_table(text: &str) -> Result<Vec<AuthUserRecord>, AuthError> {
    let mut rows = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

    let Some((_, header)) = rows.next() else {
        return Ok(Vec::new());
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    if columns.len() < 2
        || !columns[0].eq_ignore_ascii_case("username")
        || !columns[1].eq_ignore_ascii_case("password")
    {
        return Err(AuthError::Load(format!(
            "header must start with username,password, got {:?}",
            header
        )));
    }

    let mut records = Vec::new();
    for (lineno, line) in rows {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != columns.len() {
            return Err(AuthError::Load(format!(
                "line {}: expected {} fields, got {}",
                lineno,
                columns.len(),
                fields.len()
            )));
        }

        let attrs: HashMap<String, String> = columns[2..]
            .iter()
            .zip(&fields[2..])
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        records.push(AuthUserRecord {
            username: fields[0].to_string(),
            password: fields[1].to_string(),
            attrs,
        });
    }

    Ok(records)
}
