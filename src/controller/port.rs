//! Port ownership and process liveness checks, run through the transport so
//! they work on remote controller nodes too.

use crate::error::{TestError, TestResult};
use crate::transport::{Invocation, Transport};

/// Who is listening on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOwner {
    Free,
    /// Listener whose PID we can see (we own the process).
    Owned(u32),
    /// Listener owned by another user; PID hidden.
    Foreign,
}

/// Find the listener of `port` in `netstat -tulpn` output.
pub fn parse_netstat(output: &str, port: u16) -> PortOwner {
    let suffix = format!(":{}", port);
    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        // Proto Recv-Q Send-Q Local-Address Foreign-Address [State] PID/Program
        if cols.len() < 6 || !(cols[0].starts_with("tcp") || cols[0].starts_with("udp")) {
            continue;
        }
        if !cols[3].ends_with(&suffix) {
            continue;
        }
        let last = cols[cols.len() - 1];
        return match last.split('/').next().and_then(|pid| pid.parse().ok()) {
            Some(pid) => PortOwner::Owned(pid),
            None => PortOwner::Foreign,
        };
    }
    PortOwner::Free
}

pub async fn port_owner(transport: &dyn Transport, port: u16) -> TestResult<PortOwner> {
    let inv = Invocation::new("netstat").args(["-tulpn", "--numeric-ports"]);
    let out = transport.run(&inv).await?;
    if !out.success() && out.stdout.trim().is_empty() {
        return Err(TestError::HandlerFailed {
            handler: "netstat".to_string(),
            code: out.code,
            output: out.stderr.trim().to_string(),
        });
    }
    Ok(parse_netstat(&out.stdout, port))
}

/// `kill -s 0`: success, or a permission error, means the process exists.
pub async fn is_process_running(transport: &dyn Transport, pid: u32) -> TestResult<bool> {
    let inv = Invocation::new("sh")
        .arg("-c")
        .arg(format!("kill -s 0 {}", pid));
    let out = transport.run(&inv).await?;
    Ok(out.success() || out.combined().contains("not permitted"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETSTAT: &str = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State       PID/Program name
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN      -
tcp6       0      0 :::6653                 :::*                    LISTEN      4242/java
tcp6       0      0 :::8181                 :::*                    LISTEN      4242/java
udp        0      0 0.0.0.0:68              0.0.0.0:*                           611/dhclient
";

    #[test]
    fn test_owned_listener() {
        assert_eq!(parse_netstat(NETSTAT, 6653), PortOwner::Owned(4242));
    }

    #[test]
    fn test_foreign_listener() {
        assert_eq!(parse_netstat(NETSTAT, 22), PortOwner::Foreign);
    }

    #[test]
    fn test_udp_line_without_state() {
        assert_eq!(parse_netstat(NETSTAT, 68), PortOwner::Owned(611));
    }

    #[test]
    fn test_free_port_and_suffix_match() {
        assert_eq!(parse_netstat(NETSTAT, 6633), PortOwner::Free);
        // 653 must not match :6653
        assert_eq!(parse_netstat(NETSTAT, 653), PortOwner::Free);
        assert_eq!(parse_netstat("", 6653), PortOwner::Free);
    }

    #[tokio::test]
    async fn test_own_process_is_running() {
        let running = is_process_running(&crate::transport::LocalTransport, std::process::id())
            .await
            .unwrap();
        assert!(running);
    }
}
