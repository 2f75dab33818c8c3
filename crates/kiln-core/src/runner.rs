//! Command Runner - execute compiled command lines
//!
//! - Runs argv directly, or through `sh -c` for shell templates
//! - Captures stdout/stderr for the failure report
//! - Runs on a worker thread; the scheduler never calls it on the coordinator
//!   unless the build is single-job

use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Instant;

use crate::action::{Action, ActionContext, ActionOutput};
use crate::command::{CommandInput, CommandLine, CommandTemplate};

/// Execute a command line in `cwd` and capture its output
pub fn execute(line: &CommandLine, cwd: &Path) -> Result<ActionOutput> {
    let start = Instant::now();

    let mut command = match line {
        CommandLine::Argv(argv) => {
            let (program, args) = argv
                .split_first()
                .context("empty command line")?;
            let mut c = Command::new(program);
            c.args(args);
            c
        }
        CommandLine::Shell(text) => {
            // Use sh on Unix, cmd on Windows
            let (shell, shell_arg) = if cfg!(target_os = "windows") {
                ("cmd", "/C")
            } else {
                ("sh", "-c")
            };
            let mut c = Command::new(shell);
            c.arg(shell_arg).arg(text);
            c
        }
    };

    let output = command
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to spawn {:?}", line))?;

    tracing::trace!("runner: {:?} finished in {:?}", line, start.elapsed());

    Ok(ActionOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        more_tasks: Vec::new(),
    })
}

/// Action that evaluates a command template against the task and runs it
pub struct CommandAction {
    template: CommandTemplate,
}

impl CommandAction {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }

    pub fn parse(source: &str) -> Result<Self> {
        Ok(Self::new(CommandTemplate::parse(source)?))
    }

    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }
}

impl Action for CommandAction {
    fn identity(&self) -> String {
        self.template.source().to_string()
    }

    fn run(&self, cx: &ActionContext) -> Result<ActionOutput> {
        for output in &cx.outputs {
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let line = self.template.evaluate(&CommandInput {
            env: &cx.env,
            inputs: &cx.inputs,
            outputs: &cx.outputs,
            dep: cx.dep.as_ref(),
        })?;
        tracing::debug!("runner: {:?}", line);
        execute(&line, &cx.root)
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::config::ConfigSet;
    use std::sync::Arc;

    #[test]
    fn test_execute_simple_command() {
        let dir = tempfile::tempdir().unwrap();
        let output = execute(&CommandLine::Shell("echo hello".into()), dir.path()).unwrap();

        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("hello"));
    }

    #[test]
    fn test_failing_command_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let output =
            execute(&CommandLine::Shell("echo broken >&2; exit 3".into()), dir.path()).unwrap();

        assert_eq!(output.exit_code, 3);
        assert!(output.captured().contains("broken"));
    }

    #[test]
    fn test_command_action_writes_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), "abc").unwrap();

        let action = CommandAction::parse("cp ${SRC} ${TGT}").unwrap();
        let cx = ActionContext {
            root: dir.path().to_path_buf(),
            label: "cp".into(),
            inputs: vec![dir.path().join("in.txt")],
            outputs: vec![dir.path().join("out/copy.txt")],
            dep: None,
            env: Arc::new(ConfigSet::new()),
        };

        let output = action.run(&cx).unwrap();
        assert!(output.succeeded());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/copy.txt")).unwrap(),
            "abc"
        );
        assert_eq!(action.identity(), "cp ${SRC} ${TGT}");
    }
}
