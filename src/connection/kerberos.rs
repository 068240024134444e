//! Kerberos ticket-granting-ticket generation.
//!
//! When a session configuration asks for a fresh TGT, capstan shells out to
//! `kinit` before opening the transport: with `-k -t <keytab>` when a keytab
//! is configured, otherwise by writing the principal's password to kinit's
//! stdin. Command construction is separated from execution so it can be
//! verified without a Kerberos environment.

use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::config::KerberosConfig;
use super::{SessionError, SessionResult};

/// A fully-formed kinit invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TgtCommand {
    /// Arguments passed to `kinit`.
    pub args: Vec<String>,
    /// Password to write to stdin, for the passwordful variant.
    pub password: Option<String>,
}

/// Build the kinit invocation for a Kerberos configuration.
///
/// Fails when neither a keytab nor a password is available; that is a
/// configuration error, not something to discover mid-handshake.
pub fn tgt_command(config: &KerberosConfig) -> SessionResult<TgtCommand> {
    let principal = config.principal_with_realm();
    if let Some(keytab) = &config.keytab_path {
        return Ok(TgtCommand {
            args: vec![
                "-k".to_string(),
                "-t".to_string(),
                keytab.to_string_lossy().into_owned(),
                principal,
            ],
            password: None,
        });
    }
    if let Some(password) = &config.password {
        return Ok(TgtCommand {
            args: vec![principal],
            password: Some(password.clone()),
        });
    }
    Err(SessionError::InvalidConfig(format!(
        "TGT generation for {} requires a keytab or a password",
        principal
    )))
}

/// Obtain a ticket-granting ticket for the configured principal.
pub async fn generate_tgt(config: &KerberosConfig) -> SessionResult<()> {
    let invocation = tgt_command(config)?;
    debug!(
        principal = %config.principal_with_realm(),
        keytab = config.keytab_path.is_some(),
        "Generating Kerberos TGT"
    );

    let mut child = Command::new("kinit")
        .args(&invocation.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SessionError::Establishment {
            host: config.realm.clone(),
            message: format!("failed to spawn kinit: {}", e),
        })?;

    if let Some(password) = &invocation.password {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{}\n", password).as_bytes())
                .await
                .map_err(|e| SessionError::Establishment {
                    host: config.realm.clone(),
                    message: format!("failed to write kinit password: {}", e),
                })?;
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| SessionError::Establishment {
            host: config.realm.clone(),
            message: format!("failed to wait for kinit: {}", e),
        })?;

    if output.status.success() {
        debug!(principal = %config.principal_with_realm(), "TGT acquired");
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(principal = %config.principal_with_realm(), stderr = %stderr, "kinit failed");
        Err(SessionError::Authentication {
            user: config.principal_with_realm(),
            host: config.realm.clone(),
            message: format!("kinit exited with {}: {}", output.status, stderr.trim()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn keytab_variant_uses_kt_flags() {
        let config = KerberosConfig {
            principal: "deploy".into(),
            realm: "CORP.EXAMPLE".into(),
            keytab_path: Some(PathBuf::from("/etc/krb5.keytab")),
            password: None,
            generate_tgt: true,
        };
        let cmd = tgt_command(&config).unwrap();
        assert_eq!(
            cmd.args,
            vec!["-k", "-t", "/etc/krb5.keytab", "deploy@CORP.EXAMPLE"]
        );
        assert!(cmd.password.is_none());
    }

    #[test]
    fn password_variant_feeds_stdin() {
        let config = KerberosConfig {
            principal: "deploy".into(),
            realm: "CORP.EXAMPLE".into(),
            keytab_path: None,
            password: Some("s3cret".into()),
            generate_tgt: true,
        };
        let cmd = tgt_command(&config).unwrap();
        assert_eq!(cmd.args, vec!["deploy@CORP.EXAMPLE"]);
        assert_eq!(cmd.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn keytab_wins_over_password() {
        let config = KerberosConfig {
            principal: "deploy".into(),
            realm: "CORP.EXAMPLE".into(),
            keytab_path: Some(PathBuf::from("/etc/krb5.keytab")),
            password: Some("unused".into()),
            generate_tgt: true,
        };
        let cmd = tgt_command(&config).unwrap();
        assert!(cmd.password.is_none());
    }

    #[test]
    fn missing_material_is_a_config_error() {
        let config = KerberosConfig {
            principal: "deploy".into(),
            realm: "CORP.EXAMPLE".into(),
            keytab_path: None,
            password: None,
            generate_tgt: true,
        };
        assert!(matches!(
            tgt_command(&config),
            Err(SessionError::InvalidConfig(_))
        ));
    }
}
