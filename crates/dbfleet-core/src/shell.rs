// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structured shell command construction.
//!
//! Every command sent to a remote host is rendered here. Callers pass
//! structured SQL statements and credentials; quoting for the SQL layer and
//! the shell layer happens in one place.
//!
//! Two layers of escaping apply:
//!
//! | Layer | Rule |
//! |-------|------|
//! | SQL string literal | wrapped in `'...'`, embedded `'` doubled |
//! | SQL identifier | PostgreSQL `"..."`, delimiter doubled |
//! | `DO` body | dollar-quoted with a tag absent from the body |
//! | Shell double-quoted argument | `\`, `"`, `$` and `` ` `` backslash-escaped |

/// Escape a value for use inside a double-quoted shell argument.
///
/// Backslash, double quote, dollar and backtick are the only characters the
/// shell interprets inside double quotes.
pub fn escape_double_quoted(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Render a value as a double-quoted shell word.
pub fn double_quoted(value: &str) -> String {
    format!("\"{}\"", escape_double_quoted(value))
}

/// Render a SQL string literal.
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a PostgreSQL identifier.
pub fn pg_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a MySQL account reference reachable from any host.
pub fn mysql_account(username: &str) -> String {
    format!("{}@'%'", sql_literal(username))
}

/// Delimiter used for quoted heredocs carrying free-form SQL.
pub const HEREDOC_DELIMITER: &str = "DBFLEET_SQL";

/// Pick a dollar-quote tag that does not occur in `body`.
pub fn dollar_tag(body: &str) -> String {
    let mut tag = "$dbfleet$".to_string();
    let mut n = 0u32;
    while body.contains(&tag) {
        n += 1;
        tag = format!("$dbfleet_{}$", n);
    }
    tag
}

/// A single `psql` invocation run as the `postgres` system user against the
/// `postgres` database.
#[derive(Debug, Clone)]
pub struct PsqlCommand {
    statement: String,
    tuples_only: bool,
}

impl PsqlCommand {
    /// Run one SQL statement.
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            tuples_only: false,
        }
    }

    /// Print bare, unaligned rows.
    pub fn tuples_only(mut self) -> Self {
        self.tuples_only = true;
        self
    }

    /// Swallow the given PostgreSQL error condition (e.g. `duplicate_object`).
    ///
    /// The statement is wrapped in an anonymous `DO` block so the command
    /// stays idempotent when re-run. The block's dollar tag never appears in
    /// the statement, so literals containing `$$` stay intact.
    pub fn tolerate(mut self, condition: &str) -> Self {
        let statement = self.statement.trim_end().trim_end_matches(';');
        let tag = dollar_tag(statement);
        self.statement = format!(
            "DO {0} BEGIN {1}; EXCEPTION WHEN {2} THEN NULL; END {0};",
            tag, statement, condition
        );
        self
    }

    /// The SQL statement as it will be executed.
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// Render the shell command line.
    pub fn render(&self) -> String {
        let flags = if self.tuples_only {
            " -At"
        } else {
            ""
        };
        format!(
            "sudo -u postgres psql -v ON_ERROR_STOP=1{} -d {} -c {}",
            flags,
            double_quoted("postgres"),
            double_quoted(&self.statement)
        )
    }
}

/// A single `mysql` client invocation run as root.
#[derive(Debug, Clone)]
pub struct MysqlCommand {
    root_password: Option<String>,
    statement: String,
    batch: bool,
    ignore_failure: bool,
}

impl MysqlCommand {
    /// Run SQL as root over the local socket, without a password.
    ///
    /// Only valid before the root password is set during boot.
    pub fn socket(statement: impl Into<String>) -> Self {
        Self {
            root_password: None,
            statement: statement.into(),
            batch: false,
            ignore_failure: false,
        }
    }

    /// Run SQL as root authenticated with the given password.
    pub fn with_password(root_password: &str, statement: impl Into<String>) -> Self {
        Self {
            root_password: Some(root_password.to_string()),
            ..Self::socket(statement)
        }
    }

    /// Print tab-separated rows without column names.
    pub fn batch(mut self) -> Self {
        self.batch = true;
        self
    }

    /// Never fail the batch on this command.
    pub fn ignore_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }

    /// The SQL statement as it will be executed.
    pub fn statement(&self) -> &str {
        &self.statement
    }

    fn client_prefix(&self) -> String {
        let mut prefix = String::from("mysql -u root");
        if let Some(password) = &self.root_password {
            prefix.push_str(" -p");
            prefix.push_str(&double_quoted(password));
        }
        if self.batch {
            prefix.push_str(" -N -B");
        }
        prefix
    }

    /// Render the shell command line.
    pub fn render(&self) -> String {
        let mut line = format!("{} -e {}", self.client_prefix(), double_quoted(&self.statement));
        if self.ignore_failure {
            line.push_str(" || true");
        }
        line
    }
}

/// Wrap free-form SQL in a quoted heredoc fed to `command`.
///
/// Returns `None` when the SQL contains the delimiter line, which would end
/// the heredoc early.
pub fn heredoc(command: &str, sql: &str) -> Option<String> {
    if sql.lines().any(|line| line.trim() == HEREDOC_DELIMITER) {
        return None;
    }
    Some(format!(
        "{} <<'{}'\n{}\n{}",
        command,
        HEREDOC_DELIMITER,
        sql.trim_end(),
        HEREDOC_DELIMITER
    ))
}

/// `psql` prefix reading SQL from stdin.
pub fn psql_stdin(database: &str) -> String {
    format!(
        "sudo -u postgres psql -v ON_ERROR_STOP=1 -d {}",
        double_quoted(database)
    )
}

/// `mysql` prefix reading SQL from stdin.
pub fn mysql_stdin(root_password: &str, database: Option<&str>) -> String {
    let mut prefix = format!("mysql -u root -p{}", double_quoted(root_password));
    if let Some(database) = database {
        prefix.push(' ');
        prefix.push_str(&double_quoted(database));
    }
    prefix
}
