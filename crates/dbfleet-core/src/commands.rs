// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database user and privilege command generation.
//!
//! Translates a user-management intent into the ordered shell commands that
//! carry it out on the instance. The list is sent as one batch; a failure
//! midway leaves whatever ran before it in place, so every sequence is
//! written to be safe to re-run.
//!
//! | Action             | PostgreSQL (as `postgres`)                       | MySQL (as `root`)                    |
//! |--------------------|--------------------------------------------------|--------------------------------------|
//! | `create_user`      | role, password, table grants, usage, defaults     | user, password, grants, flush        |
//! | `delete_user`      | revoke tables, usage, defaults, drop role         | revoke all, drop user, flush         |
//! | `change_password`  | alter role                                       | alter user, flush                    |
//! | `grant_privileges` | table grants, defaults                           | grants, flush                        |
//! | `list_users`       | login roles                                      | users reachable from any host        |

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::{Engine, Secret};
use crate::shell::{
    MysqlCommand, PsqlCommand, heredoc, mysql_account, mysql_stdin, pg_ident, psql_stdin,
    sql_literal,
};

/// User-management action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserAction {
    /// Create a login with privileges.
    CreateUser,
    /// Revoke everything and drop the login.
    DeleteUser,
    /// Set a new password.
    ChangePassword,
    /// Add privileges.
    GrantPrivileges,
    /// List logins.
    ListUsers,
}

impl UserAction {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            UserAction::CreateUser => "create_user",
            UserAction::DeleteUser => "delete_user",
            UserAction::ChangePassword => "change_password",
            UserAction::GrantPrivileges => "grant_privileges",
            UserAction::ListUsers => "list_users",
        }
    }
}

impl fmt::Display for UserAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create_user" => Ok(UserAction::CreateUser),
            "delete_user" => Ok(UserAction::DeleteUser),
            "change_password" => Ok(UserAction::ChangePassword),
            "grant_privileges" => Ok(UserAction::GrantPrivileges),
            "list_users" => Ok(UserAction::ListUsers),
            other => Err(format!("unknown user action '{}'", other)),
        }
    }
}

/// Inputs for command generation.
///
/// Privileges are expected to be validated against the engine vocabulary
/// already (see [`crate::model::validate_privileges`]).
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    /// Target login.
    pub username: String,
    /// Password for `create_user` and `change_password`.
    pub password: Option<Secret>,
    /// Grant keywords for `create_user` and `grant_privileges`.
    pub privileges: Vec<String>,
    /// Root password, required for every MySQL action.
    pub master_password: Option<Secret>,
}

/// Generate commands from wire names.
///
/// Unknown engines and actions fail with [`Error::UnsupportedOperation`].
pub fn generate(engine: &str, action: &str, request: &CommandRequest) -> Result<Vec<String>> {
    let unsupported = || Error::UnsupportedOperation {
        engine: engine.to_string(),
        action: action.to_string(),
    };
    let parsed_engine: Engine = engine.parse().map_err(|_| unsupported())?;
    let parsed_action: UserAction = action.parse().map_err(|_| unsupported())?;
    generate_for(parsed_engine, parsed_action, request)
}

/// Generate the ordered command list for `action` on `engine`.
pub fn generate_for(
    engine: Engine,
    action: UserAction,
    request: &CommandRequest,
) -> Result<Vec<String>> {
    match engine {
        Engine::Postgresql => postgres(action, request),
        Engine::Mysql => mysql(action, request),
    }
}

fn require_password(request: &CommandRequest, action: UserAction) -> Result<&str> {
    match &request.password {
        Some(password) if !password.is_empty() => Ok(password.expose()),
        _ => Err(Error::InvalidRequest(format!("{} requires a password", action))),
    }
}

fn require_privileges(request: &CommandRequest, action: UserAction) -> Result<String> {
    if request.privileges.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "{} requires at least one privilege",
            action
        )));
    }
    Ok(request.privileges.join(", "))
}

fn require_root_password(master_password: Option<&Secret>) -> Result<&str> {
    match master_password {
        Some(password) if !password.is_empty() => Ok(password.expose()),
        _ => Err(Error::InvalidRequest(
            "MySQL commands require the master password".to_string(),
        )),
    }
}

fn require_username(request: &CommandRequest) -> Result<()> {
    if request.username.is_empty() {
        return Err(Error::InvalidRequest("username is required".to_string()));
    }
    Ok(())
}

fn postgres(action: UserAction, request: &CommandRequest) -> Result<Vec<String>> {
    if action == UserAction::ListUsers {
        return Ok(vec![
            PsqlCommand::new("SELECT rolname FROM pg_roles WHERE rolcanlogin ORDER BY rolname;")
                .tuples_only()
                .render(),
        ]);
    }

    require_username(request)?;
    let role = pg_ident(&request.username);

    let commands = match action {
        UserAction::CreateUser => {
            let password = sql_literal(require_password(request, action)?);
            let privileges = require_privileges(request, action)?;
            vec![
                PsqlCommand::new(format!("CREATE ROLE {} WITH LOGIN PASSWORD {};", role, password))
                    .tolerate("duplicate_object"),
                PsqlCommand::new(format!("ALTER ROLE {} WITH LOGIN PASSWORD {};", role, password)),
                PsqlCommand::new(format!(
                    "GRANT {} ON ALL TABLES IN SCHEMA public TO {};",
                    privileges, role
                )),
                PsqlCommand::new(format!("GRANT USAGE ON SCHEMA public TO {};", role)),
                PsqlCommand::new(format!(
                    "ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT {} ON TABLES TO {};",
                    privileges, role
                )),
            ]
        }
        UserAction::DeleteUser => vec![
            PsqlCommand::new(format!(
                "REVOKE ALL PRIVILEGES ON ALL TABLES IN SCHEMA public FROM {};",
                role
            ))
            .tolerate("undefined_object"),
            PsqlCommand::new(format!("REVOKE USAGE ON SCHEMA public FROM {};", role))
                .tolerate("undefined_object"),
            PsqlCommand::new(format!(
                "ALTER DEFAULT PRIVILEGES IN SCHEMA public REVOKE ALL ON TABLES FROM {};",
                role
            ))
            .tolerate("undefined_object"),
            PsqlCommand::new(format!("DROP ROLE IF EXISTS {};", role)),
        ],
        UserAction::ChangePassword => {
            let password = sql_literal(require_password(request, action)?);
            vec![PsqlCommand::new(format!(
                "ALTER ROLE {} WITH PASSWORD {};",
                role, password
            ))]
        }
        UserAction::GrantPrivileges => {
            let privileges = require_privileges(request, action)?;
            vec![
                PsqlCommand::new(format!(
                    "GRANT {} ON ALL TABLES IN SCHEMA public TO {};",
                    privileges, role
                )),
                PsqlCommand::new(format!(
                    "ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT {} ON TABLES TO {};",
                    privileges, role
                )),
            ]
        }
        UserAction::ListUsers => Vec::new(),
    };

    Ok(commands.iter().map(PsqlCommand::render).collect())
}

fn mysql(action: UserAction, request: &CommandRequest) -> Result<Vec<String>> {
    let root = require_root_password(request.master_password.as_ref())?;

    if action == UserAction::ListUsers {
        return Ok(vec![
            MysqlCommand::with_password(
                root,
                "SELECT User FROM mysql.user WHERE Host = '%' ORDER BY User;",
            )
            .batch()
            .render(),
        ]);
    }

    require_username(request)?;
    let account = mysql_account(&request.username);
    let flush = MysqlCommand::with_password(root, "FLUSH PRIVILEGES;");

    let commands = match action {
        UserAction::CreateUser => {
            let password = sql_literal(require_password(request, action)?);
            let privileges = require_privileges(request, action)?;
            vec![
                MysqlCommand::with_password(
                    root,
                    format!("CREATE USER IF NOT EXISTS {} IDENTIFIED BY {};", account, password),
                ),
                MysqlCommand::with_password(
                    root,
                    format!("ALTER USER {} IDENTIFIED BY {};", account, password),
                ),
                MysqlCommand::with_password(
                    root,
                    format!("GRANT {} ON *.* TO {};", privileges, account),
                ),
                flush,
            ]
        }
        UserAction::DeleteUser => vec![
            MysqlCommand::with_password(
                root,
                format!("REVOKE ALL PRIVILEGES, GRANT OPTION FROM {};", account),
            )
            .ignore_failure(),
            MysqlCommand::with_password(root, format!("DROP USER IF EXISTS {};", account)),
            flush,
        ],
        UserAction::ChangePassword => {
            let password = sql_literal(require_password(request, action)?);
            vec![
                MysqlCommand::with_password(
                    root,
                    format!("ALTER USER {} IDENTIFIED BY {};", account, password),
                ),
                flush,
            ]
        }
        UserAction::GrantPrivileges => {
            let privileges = require_privileges(request, action)?;
            vec![
                MysqlCommand::with_password(
                    root,
                    format!("GRANT {} ON *.* TO {};", privileges, account),
                ),
                flush,
            ]
        }
        UserAction::ListUsers => Vec::new(),
    };

    Ok(commands.iter().map(MysqlCommand::render).collect())
}

/// Idempotent sequence restoring a user's privileges after a partial failure.
pub fn repair_privileges(
    engine: Engine,
    username: &str,
    privileges: &[String],
    master_password: Option<&Secret>,
) -> Result<Vec<String>> {
    if privileges.is_empty() {
        return Err(Error::InvalidRequest(
            "repair requires at least one privilege".to_string(),
        ));
    }
    let privileges = privileges.join(", ");

    match engine {
        Engine::Postgresql => {
            let role = pg_ident(username);
            Ok([
                format!("GRANT USAGE ON SCHEMA public TO {};", role),
                format!("GRANT {} ON ALL TABLES IN SCHEMA public TO {};", privileges, role),
                format!("GRANT USAGE, SELECT ON ALL SEQUENCES IN SCHEMA public TO {};", role),
                format!(
                    "ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT {} ON TABLES TO {};",
                    privileges, role
                ),
                format!(
                    "ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT USAGE, SELECT ON SEQUENCES TO {};",
                    role
                ),
            ]
            .into_iter()
            .map(|statement| PsqlCommand::new(statement).render())
            .collect())
        }
        Engine::Mysql => {
            let root = require_root_password(master_password)?;
            let account = mysql_account(username);
            Ok(vec![
                MysqlCommand::with_password(
                    root,
                    format!("GRANT {} ON *.* TO {};", privileges, account),
                )
                .render(),
                MysqlCommand::with_password(root, "FLUSH PRIVILEGES;").render(),
            ])
        }
    }
}

/// Run free-form SQL as the superuser.
///
/// The SQL travels in a quoted heredoc, so the shell expands nothing in it.
pub fn run_sql(
    engine: Engine,
    database: Option<&str>,
    sql: &str,
    master_password: Option<&Secret>,
) -> Result<Vec<String>> {
    if sql.trim().is_empty() {
        return Err(Error::InvalidRequest("SQL must not be empty".to_string()));
    }

    let client = match engine {
        Engine::Postgresql => psql_stdin(database.unwrap_or("postgres")),
        Engine::Mysql => mysql_stdin(require_root_password(master_password)?, database),
    };

    heredoc(&client, sql).map(|command| vec![command]).ok_or_else(|| {
        Error::InvalidRequest("SQL contains the reserved heredoc delimiter".to_string())
    })
}

/// Commands checking that the engine service is up and answering queries.
pub fn health_check(engine: Engine, master_password: Option<&Secret>) -> Result<Vec<String>> {
    let service = format!("systemctl is-active {}", engine.service_name());
    let query = match engine {
        Engine::Postgresql => PsqlCommand::new("SELECT version();").tuples_only().render(),
        Engine::Mysql => MysqlCommand::with_password(
            require_root_password(master_password)?,
            "SELECT VERSION();",
        )
        .batch()
        .render(),
    };
    Ok(vec![service, query])
}
