use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// OS process inspection used by the classifier.
///
/// Failures are reported as "nothing found": a query that can't be answered
/// must never cause a terminal to be tracked.
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    async fn command_line_of(&self, pid: u32) -> Option<String>;

    /// Direct children only
    async fn child_processes_of(&self, pid: u32) -> Vec<u32>;
}

/// Inspector that shells out to the platform's process tools
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInspector;

#[cfg(unix)]
#[async_trait]
impl ProcessInspector for SystemInspector {
    async fn command_line_of(&self, pid: u32) -> Option<String> {
        let stdout = run("ps", &["-o", "command=", "-p", &pid.to_string()]).await?;
        parse_command_output(&stdout)
    }

    async fn child_processes_of(&self, pid: u32) -> Vec<u32> {
        // pgrep exits 1 when there are no children; empty output covers it
        run("pgrep", &["-P", &pid.to_string()])
            .await
            .map(|stdout| parse_pid_list(&stdout))
            .unwrap_or_default()
    }
}

#[cfg(windows)]
#[async_trait]
impl ProcessInspector for SystemInspector {
    async fn command_line_of(&self, pid: u32) -> Option<String> {
        let filter = format!("ProcessId={pid}");
        let stdout = run(
            "wmic",
            &["process", "where", &filter, "get", "CommandLine", "/value"],
        )
        .await?;
        parse_wmic_values(&stdout, "CommandLine").into_iter().next()
    }

    async fn child_processes_of(&self, pid: u32) -> Vec<u32> {
        let filter = format!("ParentProcessId={pid}");
        run(
            "wmic",
            &["process", "where", &filter, "get", "ProcessId", "/value"],
        )
        .await
        .map(|stdout| {
            parse_wmic_values(&stdout, "ProcessId")
                .iter()
                .filter_map(|v| v.parse().ok())
                .collect()
        })
        .unwrap_or_default()
    }
}

async fn run(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).kill_on_drop(true).output().await {
        Ok(output) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Err(e) => {
            debug!(program, error = %e, "Process query failed");
            None
        }
    }
}

/// Trimmed single-line output, `None` when empty
pub fn parse_command_output(stdout: &str) -> Option<String> {
    let command = stdout.trim();
    (!command.is_empty()).then(|| command.to_string())
}

/// Whitespace-separated pids; anything unparseable is skipped
pub fn parse_pid_list(stdout: &str) -> Vec<u32> {
    stdout
        .split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect()
}

/// Values of `Key=value` lines in `wmic ... /value` output
pub fn parse_wmic_values(stdout: &str, key: &str) -> Vec<String> {
    let prefix = format!("{key}=");
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(&prefix))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_output() {
        assert_eq!(
            parse_command_output("  node /usr/lib/node_modules/@anthropic-ai/claude-code/cli.js\n"),
            Some("node /usr/lib/node_modules/@anthropic-ai/claude-code/cli.js".to_string())
        );
        assert_eq!(parse_command_output("\n"), None);
    }

    #[test]
    fn test_parse_pid_list() {
        assert_eq!(parse_pid_list("123\n456\n"), vec![123, 456]);
        assert_eq!(parse_pid_list(""), Vec::<u32>::new());
        assert_eq!(parse_pid_list("12 junk 13"), vec![12, 13]);
    }

    #[test]
    fn test_parse_wmic_values() {
        let out = "\r\n\r\nCommandLine=\"C:\\bin\\claude.exe\" --resume\r\n\r\n";
        assert_eq!(
            parse_wmic_values(out, "CommandLine"),
            vec!["\"C:\\bin\\claude.exe\" --resume".to_string()]
        );
        let pids = "ProcessId=10\r\n\r\nProcessId=11\r\nProcessId=\r\n";
        assert_eq!(parse_wmic_values(pids, "ProcessId"), vec!["10", "11"]);
    }
}
