// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance launch planning.
//!
//! Builds the boot script handed to a new machine as user data. The script
//! has exactly two blocks, in this order:
//!
//! 1. **Agent block** - installs the remote management agent (snap first,
//!    the distribution package as fallback), clears any stale registration,
//!    restarts it and checks that the service is active.
//! 2. **Engine block** - installs the requested engine, sets the superuser
//!    password, creates the master login, listens on all interfaces on the
//!    requested port and restarts the engine.
//!
//! PostgreSQL comes from the PGDG repository, pinned to the requested major
//! version. MySQL comes from the MySQL APT repository, pinned to the release
//! series of the requested version (see [`mysql_series`]); versions outside
//! the supported series are rejected before anything is launched.
//!
//! The output depends only on the request and the timestamp embedded in the
//! script's log lines.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{Engine, validate_username};
use crate::shell::{MysqlCommand, PsqlCommand, mysql_account, pg_ident, sql_literal};

/// Marker line opening the agent block.
pub const AGENT_BLOCK_MARKER: &str = "# --- dbfleet: remote agent ---";
/// Marker line opening the PostgreSQL block.
pub const POSTGRES_BLOCK_MARKER: &str = "# --- dbfleet: postgresql ---";
/// Marker line opening the MySQL block.
pub const MYSQL_BLOCK_MARKER: &str = "# --- dbfleet: mysql ---";

const BOOT_LOG: &str = "/var/log/dbfleet-boot.log";

/// MySQL release series the boot plan installs, with their APT repository
/// component.
const MYSQL_SERIES: &[(&str, &str)] = &[("8.0", "mysql-8.0"), ("8.4", "mysql-8.4-lts")];

const MYSQL_CONF: &str = "/etc/mysql/mysql.conf.d/mysqld.cnf";

/// APT repository component for a MySQL version, `None` when unsupported.
///
/// The series is the first two version components, so `8.0.36` maps to the
/// `8.0` series.
pub fn mysql_series(version: &str) -> Option<&'static str> {
    let mut parts = version.split('.');
    let series = match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => format!("{}.{}", major, minor),
        _ => return None,
    };
    MYSQL_SERIES
        .iter()
        .find(|(name, _)| *name == series)
        .map(|(_, component)| *component)
}

/// Inputs for a boot script.
#[derive(Debug, Clone)]
pub struct BootRequest<'a> {
    /// Engine name, `postgresql` or `mysql`.
    pub engine: &'a str,
    /// Engine version, digits and dots only.
    pub engine_version: &'a str,
    /// Master login name.
    pub master_username: &'a str,
    /// Master login password.
    pub master_password: &'a str,
    /// Port the engine listens on.
    pub port: u16,
}

/// A rendered boot script.
#[derive(Clone, PartialEq, Eq)]
pub struct BootScript(String);

impl BootScript {
    /// The script text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base64 encoding as expected by provider launch APIs.
    pub fn to_user_data(&self) -> String {
        BASE64.encode(self.0.as_bytes())
    }
}

impl std::fmt::Debug for BootScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BootScript({} bytes)", self.0.len())
    }
}

/// Build the boot script for a request, timestamped now.
pub fn plan_boot(request: &BootRequest<'_>) -> Result<BootScript> {
    plan_boot_at(request, Utc::now())
}

/// Build the boot script for a request with a fixed timestamp.
pub fn plan_boot_at(request: &BootRequest<'_>, now: DateTime<Utc>) -> Result<BootScript> {
    let engine: Engine = request.engine.parse()?;
    validate(engine, request)?;

    let stamp = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut script = String::with_capacity(4096);
    script.push_str("#!/bin/bash\n");
    script.push_str("set -euo pipefail\n");
    script.push_str(&format!("exec > >(tee -a {0}) 2>&1\n", BOOT_LOG));
    script.push_str(&format!(
        "echo \"[{}] dbfleet boot: {} {} on port {}\"\n\n",
        stamp,
        engine,
        request.engine_version,
        request.port
    ));

    script.push_str(&agent_block(&stamp));
    script.push('\n');
    match engine {
        Engine::Postgresql => script.push_str(&postgres_block(request, &stamp)),
        Engine::Mysql => {
            let component = mysql_series(request.engine_version).ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "unsupported mysql version '{}'",
                    request.engine_version
                ))
            })?;
            script.push_str(&mysql_block(request, component, &stamp))
        }
    }
    script.push_str(&format!("\necho \"[{}] dbfleet boot: done\"\n", stamp));

    Ok(BootScript(script))
}

fn validate(engine: Engine, request: &BootRequest<'_>) -> Result<()> {
    let version = request.engine_version;
    let version_ok = !version.is_empty()
        && version.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !version.starts_with('.')
        && !version.ends_with('.');
    if !version_ok {
        return Err(Error::InvalidRequest(format!(
            "invalid engine version '{}'",
            version
        )));
    }
    if engine == Engine::Mysql && mysql_series(version).is_none() {
        let supported: Vec<&str> = MYSQL_SERIES.iter().map(|(name, _)| *name).collect();
        return Err(Error::InvalidRequest(format!(
            "unsupported mysql version '{}', supported series: {}",
            version,
            supported.join(", ")
        )));
    }
    if request.port == 0 {
        return Err(Error::InvalidRequest("port must be non-zero".to_string()));
    }
    validate_username(request.master_username)?;
    if engine.is_reserved_username(request.master_username) {
        return Err(Error::InvalidRequest(format!(
            "master username '{}' is reserved by {}",
            request.master_username, engine
        )));
    }
    if request.master_password.is_empty() {
        return Err(Error::InvalidRequest(
            "master password must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn agent_block(stamp: &str) -> String {
    let lines = [
        AGENT_BLOCK_MARKER.to_string(),
        format!("echo \"[{}] installing remote agent\"", stamp),
        "if ! snap install amazon-ssm-agent --classic; then".to_string(),
        "  curl -fsSL -o /tmp/amazon-ssm-agent.deb \\".to_string(),
        "    \"https://s3.amazonaws.com/ec2-downloads-windows/SSMAgent/latest/debian_amd64/amazon-ssm-agent.deb\"".to_string(),
        "  dpkg -i /tmp/amazon-ssm-agent.deb".to_string(),
        "fi".to_string(),
        "AGENT_UNIT=snap.amazon-ssm-agent.amazon-ssm-agent.service".to_string(),
        "systemctl list-unit-files \"$AGENT_UNIT\" >/dev/null 2>&1 || AGENT_UNIT=amazon-ssm-agent".to_string(),
        "systemctl stop \"$AGENT_UNIT\" || true".to_string(),
        "rm -rf /var/lib/amazon/ssm/registration".to_string(),
        "systemctl enable \"$AGENT_UNIT\"".to_string(),
        "systemctl restart \"$AGENT_UNIT\"".to_string(),
        "systemctl is-active --quiet \"$AGENT_UNIT\"".to_string(),
        format!("echo \"[{}] remote agent active\"", stamp),
    ];
    let mut block = lines.join("\n");
    block.push('\n');
    block
}

fn postgres_block(request: &BootRequest<'_>, stamp: &str) -> String {
    let version = request.engine_version;
    let major = version.split('.').next().unwrap_or(version);
    let conf_dir = format!("/etc/postgresql/{}/main", major);

    let set_superuser = PsqlCommand::new(format!(
        "ALTER USER postgres WITH PASSWORD {};",
        sql_literal(request.master_password)
    ));
    let create_master = PsqlCommand::new(format!(
        "CREATE ROLE {} WITH LOGIN CREATEDB CREATEROLE PASSWORD {};",
        pg_ident(request.master_username),
        sql_literal(request.master_password)
    ))
    .tolerate("duplicate_object");
    let reset_master = PsqlCommand::new(format!(
        "ALTER ROLE {} WITH LOGIN CREATEDB CREATEROLE PASSWORD {};",
        pg_ident(request.master_username),
        sql_literal(request.master_password)
    ));

    let lines = [
        POSTGRES_BLOCK_MARKER.to_string(),
        format!("echo \"[{}] installing postgresql {}\"", stamp, version),
        "export DEBIAN_FRONTEND=noninteractive".to_string(),
        "apt-get update -y".to_string(),
        "apt-get install -y curl ca-certificates gnupg lsb-release".to_string(),
        "install -d /usr/share/postgresql-common/pgdg".to_string(),
        "curl -fsSL -o /usr/share/postgresql-common/pgdg/apt.postgresql.org.asc https://www.postgresql.org/media/keys/ACCC4CF8.asc".to_string(),
        "echo \"deb [signed-by=/usr/share/postgresql-common/pgdg/apt.postgresql.org.asc] https://apt.postgresql.org/pub/repos/apt $(lsb_release -cs)-pgdg main\" > /etc/apt/sources.list.d/pgdg.list".to_string(),
        "apt-get update -y".to_string(),
        format!("apt-get install -y postgresql-{0} postgresql-client-{0}", major),
        "systemctl enable postgresql".to_string(),
        "systemctl start postgresql".to_string(),
        set_superuser.render(),
        create_master.render(),
        reset_master.render(),
        format!(
            "sed -i \"s/^#\\?listen_addresses.*/listen_addresses = '*'/\" {}/postgresql.conf",
            conf_dir
        ),
        format!(
            "sed -i \"s/^#\\?port = .*/port = {}/\" {}/postgresql.conf",
            request.port, conf_dir
        ),
        format!(
            "echo \"host    all    all    0.0.0.0/0    md5\" >> {}/pg_hba.conf",
            conf_dir
        ),
        "systemctl restart postgresql".to_string(),
        format!("echo \"[{}] postgresql ready on port {}\"", stamp, request.port),
    ];
    let mut block = lines.join("\n");
    block.push('\n');
    block
}

fn mysql_block(request: &BootRequest<'_>, component: &str, stamp: &str) -> String {
    let password = sql_literal(request.master_password);
    let account = mysql_account(request.master_username);

    // Fresh community installs authenticate root over the socket.
    let set_root = MysqlCommand::socket(format!(
        "ALTER USER 'root'@'localhost' IDENTIFIED WITH caching_sha2_password BY {};",
        password
    ));
    let create_master = MysqlCommand::with_password(
        request.master_password,
        format!(
            "CREATE USER IF NOT EXISTS {0} IDENTIFIED BY {1}; \
             ALTER USER {0} IDENTIFIED BY {1}; \
             GRANT ALL PRIVILEGES ON *.* TO {0} WITH GRANT OPTION; \
             FLUSH PRIVILEGES;",
            account, password
        ),
    );

    let lines = [
        MYSQL_BLOCK_MARKER.to_string(),
        format!(
            "echo \"[{}] installing mysql {}\"",
            stamp, request.engine_version
        ),
        "export DEBIAN_FRONTEND=noninteractive".to_string(),
        "apt-get update -y".to_string(),
        "apt-get install -y curl ca-certificates gnupg lsb-release".to_string(),
        "install -d /usr/share/keyrings".to_string(),
        "curl -fsSL https://repo.mysql.com/RPM-GPG-KEY-mysql-2023 | gpg --dearmor --yes -o /usr/share/keyrings/mysql.gpg".to_string(),
        format!(
            "echo \"deb [signed-by=/usr/share/keyrings/mysql.gpg] http://repo.mysql.com/apt/ubuntu $(lsb_release -cs) {}\" > /etc/apt/sources.list.d/mysql.list",
            component
        ),
        "apt-get update -y".to_string(),
        "apt-get install -y mysql-community-server mysql-client".to_string(),
        "systemctl enable mysql".to_string(),
        "systemctl start mysql".to_string(),
        set_root.render(),
        create_master.render(),
        format!(
            "grep -q \"^bind-address\" {0} \
             && sed -i \"s/^bind-address.*/bind-address = 0.0.0.0/\" {0} \
             || echo \"bind-address = 0.0.0.0\" >> {0}",
            MYSQL_CONF
        ),
        format!(
            "grep -q \"^port\" {0} \
             && sed -i \"s/^port.*/port = {1}/\" {0} \
             || echo \"port = {1}\" >> {0}",
            MYSQL_CONF, request.port
        ),
        "systemctl restart mysql".to_string(),
        format!("echo \"[{}] mysql ready on port {}\"", stamp, request.port),
    ];
    let mut block = lines.join("\n");
    block.push('\n');
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use chrono::TimeZone;

    fn request<'a>(engine: &'a str, password: &'a str) -> BootRequest<'a> {
        BootRequest {
            engine,
            engine_version: if engine == "mysql" { "8.0" } else { "13" },
            master_username: "dbadmin",
            master_password: password,
            port: 5432,
        }
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_postgres_script_has_agent_then_engine_block() {
        let script = plan_boot_at(&request("postgresql", "Secr3t!pw"), fixed_time()).unwrap();
        let text = script.as_str();

        assert_eq!(text.matches(AGENT_BLOCK_MARKER).count(), 1);
        assert_eq!(text.matches(POSTGRES_BLOCK_MARKER).count(), 1);
        assert_eq!(text.matches(MYSQL_BLOCK_MARKER).count(), 0);
        let agent = text.find(AGENT_BLOCK_MARKER).unwrap();
        let engine = text.find(POSTGRES_BLOCK_MARKER).unwrap();
        assert!(agent < engine);

        assert!(text.contains("apt-get install -y postgresql-13"));
        assert!(text.contains("listen_addresses = '*'"));
        assert!(text.contains("port = 5432"));
        assert!(text.contains("0.0.0.0/0    md5"));
        assert!(text.contains("CREATE ROLE \\\"dbadmin\\\" WITH LOGIN CREATEDB CREATEROLE"));
    }

    #[test]
    fn test_agent_block_installs_with_fallback_and_verifies() {
        let script = plan_boot_at(&request("mysql", "pw"), fixed_time()).unwrap();
        let text = script.as_str();
        let snap = text.find("snap install amazon-ssm-agent").unwrap();
        let fallback = text.find("dpkg -i").unwrap();
        let verify = text.find("systemctl is-active").unwrap();
        assert!(snap < fallback && fallback < verify);
        assert!(text.contains("rm -rf /var/lib/amazon/ssm/registration"));
    }

    #[test]
    fn test_mysql_script() {
        let mut req = request("mysql", "pw");
        req.engine_version = "8.0";
        req.port = 3307;
        let text = plan_boot_at(&req, fixed_time()).unwrap().as_str().to_string();

        assert_eq!(text.matches(MYSQL_BLOCK_MARKER).count(), 1);
        assert!(text.contains("'dbadmin'@'%'"));
        assert!(text.contains("WITH GRANT OPTION"));
        assert!(text.contains("bind-address = 0.0.0.0"));
        assert!(text.contains("port = 3307"));
    }

    #[test]
    fn test_unknown_engine_fails_without_script() {
        let result = plan_boot_at(&request("oracle", "pw"), fixed_time());
        assert!(matches!(result, Err(Error::UnsupportedEngine(name)) if name == "oracle"));
    }

    #[test]
    fn test_deterministic_for_fixed_time() {
        let a = plan_boot_at(&request("postgresql", "pw"), fixed_time()).unwrap();
        let b = plan_boot_at(&request("postgresql", "pw"), fixed_time()).unwrap();
        assert_eq!(a, b);
        assert!(a.as_str().contains("2025-03-01T12:00:00Z"));
    }

    #[test]
    fn test_password_escaped_for_shell_and_sql() {
        let script = plan_boot_at(&request("mysql", "a'b\"c$d"), fixed_time()).unwrap();
        let text = script.as_str();
        // SQL layer doubles the quote, shell layer escapes " and $.
        assert!(text.contains("'a''b\\\"c\\$d'"));
        assert!(text.contains("-p\"a'b\\\"c\\$d\""));
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let mut req = request("postgresql", "pw");
        req.engine_version = "13; rm -rf /";
        assert!(matches!(plan_boot_at(&req, fixed_time()), Err(Error::InvalidRequest(_))));

        let req = request("postgresql", "");
        assert!(matches!(plan_boot_at(&req, fixed_time()), Err(Error::InvalidRequest(_))));

        let mut req = request("postgresql", "pw");
        req.master_username = "bad name";
        assert!(plan_boot_at(&req, fixed_time()).is_err());
    }

    #[test]
    fn test_mysql_version_selects_repository_series() {
        let mut req = request("mysql", "pw");
        req.engine_version = "8.0.36";
        let text = plan_boot_at(&req, fixed_time()).unwrap().as_str().to_string();
        assert!(text.contains("repo.mysql.com/apt/ubuntu $(lsb_release -cs) mysql-8.0\""));

        req.engine_version = "8.4";
        let text = plan_boot_at(&req, fixed_time()).unwrap().as_str().to_string();
        assert!(text.contains("$(lsb_release -cs) mysql-8.4-lts"));
        assert!(!text.contains("mysql-8.0"));
    }

    #[test]
    fn test_unsupported_mysql_version_rejected() {
        for version in ["5.7", "8", "9.9"] {
            let mut req = request("mysql", "pw");
            req.engine_version = version;
            assert!(
                matches!(plan_boot_at(&req, fixed_time()), Err(Error::InvalidRequest(_))),
                "{}",
                version
            );
        }
        assert_eq!(mysql_series("8.4.2"), Some("mysql-8.4-lts"));
        assert_eq!(mysql_series("5.7"), None);
    }

    #[test]
    fn test_reserved_master_username_rejected() {
        let mut req = request("postgresql", "pw");
        req.master_username = "postgres";
        assert!(matches!(plan_boot_at(&req, fixed_time()), Err(Error::InvalidRequest(_))));

        let mut req = request("mysql", "pw");
        req.master_username = "root";
        assert!(matches!(plan_boot_at(&req, fixed_time()), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_postgres_password_with_dollar_quotes() {
        let script = plan_boot_at(&request("postgresql", "ab$$c'd\\e"), fixed_time()).unwrap();
        let text = script.as_str();
        let create = text
            .lines()
            .find(|line| line.contains("CREATE ROLE"))
            .unwrap();
        // Shell-escaped: the dollar tag and the literal both survive intact.
        assert!(create.contains("DO \\$dbfleet\\$ BEGIN"), "{}", create);
        assert!(create.contains("PASSWORD 'ab\\$\\$c''d\\\\e'"), "{}", create);
        assert!(create.contains("END \\$dbfleet\\$;"), "{}", create);
    }

    #[test]
    fn test_user_data_is_base64() {
        let script = plan_boot_at(&request("postgresql", "pw"), fixed_time()).unwrap();
        let decoded = BASE64.decode(script.to_user_data()).unwrap();
        assert_eq!(decoded, script.as_str().as_bytes());
    }
}
