//! Named SQL statements loaded from `.sql` files
//!
//! A mapping file holds any number of statements, each introduced by a
//! marker line:
//!
//! ```sql
//! -- name: find_user
//! SELECT id, email FROM users WHERE id = ?;
//!
//! -- name: count_users
//! SELECT COUNT(*) AS total FROM users
//! ```
//!
//! Other comment lines are dropped, as is a trailing `;`.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const NAME_MARKER: &str = "-- name:";

/// One named statement and the file it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedStatement {
    pub name: String,
    pub sql: String,
    pub source: PathBuf,
}

/// Named statements attached to a session factory
#[derive(Debug, Clone, Default)]
pub struct StatementMappings {
    statements: HashMap<String, MappedStatement>,
}

impl StatementMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.sql` file under the given files or directories
    ///
    /// Directories are walked recursively in name order. Missing locations
    /// are skipped with a warning.
    pub fn discover(locations: &[PathBuf]) -> Result<Self> {
        let mut mappings = Self::new();

        for location in locations {
            if !location.exists() {
                log::warn!("Mapper location {} does not exist", location.display());
                continue;
            }

            let mut files = Vec::new();
            collect_sql_files(location, &mut files)?;
            files.sort();

            for file in files {
                mappings.load_file(&file)?;
            }
        }

        log::debug!(
            "Discovered {} mapped statements in {} location(s)",
            mappings.len(),
            locations.len()
        );

        Ok(mappings)
    }

    /// Parse one mapping file and add its statements
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!(
                "Failed to read mapping file {}: {}",
                path.display(),
                e
            ))
        })?;

        self.load_str(&content, path)
    }

    /// Parse mapping text; `source` is recorded on each statement
    pub fn load_str(&mut self, content: &str, source: &Path) -> Result<()> {
        let mut current: Option<(String, Vec<&str>)> = None;

        for line in content.lines() {
            let trimmed = line.trim();

            if let Some(name) = trimmed.strip_prefix(NAME_MARKER) {
                if let Some((name, body)) = current.take() {
                    self.finish(name, &body, source)?;
                }
                let name = name.trim();
                if name.is_empty() {
                    return Err(Error::configuration(format!(
                        "Unnamed statement marker in {}",
                        source.display()
                    )));
                }
                current = Some((name.to_string(), Vec::new()));
                continue;
            }

            if trimmed.is_empty() || trimmed.starts_with("--") {
                continue;
            }

            match current.as_mut() {
                Some((_, body)) => body.push(line),
                None => {
                    return Err(Error::configuration(format!(
                        "SQL before the first '{}' marker in {}",
                        NAME_MARKER,
                        source.display()
                    )))
                }
            }
        }

        if let Some((name, body)) = current.take() {
            self.finish(name, &body, source)?;
        }

        Ok(())
    }

    fn finish(&mut self, name: String, body: &[&str], source: &Path) -> Result<()> {
        let sql = body.join("\n");
        let sql = sql.trim().trim_end_matches(';').trim_end().to_string();

        if sql.is_empty() {
            return Err(Error::configuration(format!(
                "Statement '{}' in {} is empty",
                name,
                source.display()
            )));
        }

        self.insert(MappedStatement {
            name,
            sql,
            source: source.to_path_buf(),
        })
    }

    /// Add a statement; names must be unique
    pub fn insert(&mut self, statement: MappedStatement) -> Result<()> {
        if let Some(existing) = self.statements.get(&statement.name) {
            return Err(Error::configuration(format!(
                "Statement '{}' is defined in both {} and {}",
                statement.name,
                existing.source.display(),
                statement.source.display()
            )));
        }
        self.statements.insert(statement.name.clone(), statement);
        Ok(())
    }

    /// Add every statement of `other`
    pub fn merge(&mut self, other: &StatementMappings) -> Result<()> {
        for statement in other.statements.values() {
            self.insert(statement.clone())?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MappedStatement> {
        self.statements.get(name)
    }

    pub fn sql(&self, name: &str) -> Option<&str> {
        self.statements.get(name).map(|s| s.sql.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.statements.contains_key(name)
    }

    /// Statement names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.statements.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

fn collect_sql_files(path: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_file() {
        if path.extension().and_then(|s| s.to_str()) == Some("sql") {
            files.push(path.to_path_buf());
        }
        return Ok(());
    }

    let entries = fs::read_dir(path).map_err(|e| {
        Error::configuration(format!(
            "Failed to read mapper directory {}: {}",
            path.display(),
            e
        ))
    })?;

    for entry in entries {
        let entry = entry?;
        collect_sql_files(&entry.path(), files)?;
    }

    Ok(())
}
