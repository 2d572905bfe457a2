//! Remote execution through the system `ssh` client.

use std::path::Path;
use std::process::Stdio;

use crate::config::NodeConfig;
use crate::error::{TestError, TestResult};

use super::{CommandOutput, Invocation, Transport};

/// Runs commands on a remote node with `ssh -o BatchMode=yes`.
///
/// Authentication is left to the SSH agent or configured identity files;
/// batch mode makes a missing key fail fast instead of prompting.
#[derive(Debug, Clone)]
pub struct SshTransport {
    host: String,
    port: u16,
    user: String,
    identity_file: Option<String>,
}

impl SshTransport {
    pub fn new(node: &NodeConfig) -> Self {
        Self {
            host: node.host.clone(),
            port: node.ssh_port,
            user: node.user.clone(),
            identity_file: node.identity_file.clone(),
        }
    }

    /// Remote shell line: environment exports followed by the quoted argv.
    pub fn remote_line(invocation: &Invocation) -> String {
        let mut line = String::new();
        for (key, value) in &invocation.env {
            line.push_str(&format!("export {}={}; ", key, shell_quote(value)));
        }
        line.push_str(&shell_quote(&invocation.program));
        for arg in &invocation.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line
    }
}

#[async_trait::async_trait]
impl Transport for SshTransport {
    fn command(&self, invocation: &Invocation) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-p")
            .arg(self.port.to_string());
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", self.user, self.host))
            .arg(Self::remote_line(invocation));
        cmd
    }

    fn describe(&self) -> String {
        format!("ssh {}@{}:{}", self.user, self.host, self.port)
    }

    async fn fetch_dir(&self, remote: &Path, local: &Path) -> TestResult<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut cmd = tokio::process::Command::new("scp");
        cmd.arg("-B").arg("-r").arg("-P").arg(self.port.to_string());
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}:{}", self.user, self.host, remote.display()))
            .arg(local)
            .stdin(Stdio::null());
        let output: CommandOutput = cmd.output().await?.into();
        if !output.success() {
            return Err(TestError::HandlerFailed {
                handler: "scp".to_string(),
                code: output.code,
                output: output.combined().trim().to_string(),
            });
        }
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:,=@%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_args_are_not_quoted() {
        let inv = Invocation::new("/opt/odl/start.sh").arg("6653");
        assert_eq!(SshTransport::remote_line(&inv), "/opt/odl/start.sh 6653");
    }

    #[test]
    fn test_env_becomes_export_prefix() {
        let inv = Invocation::new("start.sh").env("JAVA_OPTS", "-Xmx4G -XX:+UseG1GC");
        assert_eq!(
            SshTransport::remote_line(&inv),
            "export JAVA_OPTS='-Xmx4G -XX:+UseG1GC'; start.sh"
        );
    }

    #[test]
    fn test_single_quotes_are_escaped() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_describe() {
        let node = NodeConfig {
            host: "10.0.0.5".into(),
            ssh_port: 2222,
            user: "ops".into(),
            identity_file: None,
        };
        assert_eq!(SshTransport::new(&node).describe(), "ssh ops@10.0.0.5:2222");
    }
}
