//! Runs a plugin executable under a pseudo terminal.
//!
//! The plugin gets the pty slave as stdin/stdout/stderr so interactive tools
//! it spawns behave normally, while this process keeps the master side to
//! write request headers, relay operator input, and interpret output lines.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};

use crate::error::Error;

use super::protocol::{self, Interpreter};
use super::{Hook, HookOutcome, Manifest, Plugin, PluginKind};

/// Exit code a plugin uses to say "I don't do that" without failing.
const DECLINED_EXIT_CODE: i32 = 255;

pub struct PluginHost {
    name: String,
    version: String,
    kind: PluginKind,
    base_dir: PathBuf,
    executable: PathBuf,
    verbose: bool,
}

impl PluginHost {
    /// Build a host from a parsed manifest. Fails if the manifest declares
    /// no executable.
    pub fn from_manifest(
        name: &str,
        base_dir: &Path,
        manifest: &Manifest,
        verbose: bool,
    ) -> Result<Self> {
        let executable = manifest
            .executable
            .as_deref()
            .with_context(|| format!("plugin [{name}] declares no executable"))?;
        Ok(Self {
            name: name.to_string(),
            version: manifest.version.clone().unwrap_or_else(|| "0".to_string()),
            kind: manifest.kind,
            base_dir: base_dir.to_path_buf(),
            executable: base_dir.join(executable),
            verbose,
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn execute(&self, hook: Hook, args: &[String]) -> Result<HookOutcome> {
        let pty = openpty(None::<&Winsize>, None::<&Termios>)
            .context("unable to open a pseudo terminal")?;

        // Keep the slave a real terminal but stop it from reflecting the
        // request header back at us.
        let mut termios = tcgetattr(&pty.master).context("unable to read terminal attributes")?;
        termios
            .local_flags
            .remove(LocalFlags::ECHO | LocalFlags::ECHONL | LocalFlags::ECHOCTL);
        tcsetattr(&pty.master, SetArg::TCSAFLUSH, &termios)
            .context("unable to disable terminal echo")?;

        let stdin_fd = pty.slave.try_clone().context("unable to clone terminal fd")?;
        let stdout_fd = pty.slave.try_clone().context("unable to clone terminal fd")?;
        let mut child = Command::new(&self.executable)
            .arg0(&self.name)
            .current_dir(&self.base_dir)
            .stdin(Stdio::from(stdin_fd))
            .stdout(Stdio::from(stdout_fd))
            .stderr(Stdio::from(pty.slave))
            .spawn()
            .with_context(|| format!("unable to spawn plugin [{}]", self.name))?;

        let mut master = File::from(pty.master);
        protocol::write_request(&mut master, hook, args)
            .with_context(|| format!("unable to send [{hook}] to plugin [{}]", self.name))?;

        let mut interpreter = Interpreter::new(self.verbose);
        let stdin = io::stdin();
        let mut stdout = io::stdout();
        pump(&mut master, Some(&stdin), &mut interpreter, &mut stdout)?;

        let status = child
            .wait()
            .with_context(|| format!("unable to wait for plugin [{}]", self.name))?;
        self.decode_status(status, interpreter.into_returns())
    }

    fn decode_status(&self, status: ExitStatus, returns: Vec<String>) -> Result<HookOutcome> {
        if let Some(code) = status.code() {
            return match code {
                0 => Ok(HookOutcome::Handled(returns)),
                DECLINED_EXIT_CODE => Ok(HookOutcome::Declined),
                code => {
                    let reason = format!("exit code {code}");
                    log::error!("plugin [{}] failed: {reason}", self.name);
                    Err(Error::AbnormalTermination { name: self.name.clone(), reason }.into())
                }
            };
        }
        let reason = if let Some(signal) = status.signal() {
            if status.core_dumped() {
                log::error!("plugin [{}] dumped core", self.name);
            }
            format!("terminated by signal {signal}")
        } else if let Some(signal) = status.stopped_signal() {
            format!("stopped by signal {signal}")
        } else {
            "did not exit cleanly".to_string()
        };
        log::error!("plugin [{}] failed: {reason}", self.name);
        Err(Error::AbnormalTermination { name: self.name.clone(), reason }.into())
    }
}

impl Plugin for PluginHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn kind(&self) -> PluginKind {
        self.kind
    }

    fn run(&self, hook: Hook, args: &[String]) -> Result<HookOutcome> {
        log::trace!("offering [{hook}] to plugin [{}]", self.name);
        self.execute(hook, args)
    }
}

/// Shuttle bytes between the plugin terminal, operator input and operator
/// output until the plugin closes its side of the terminal.
///
/// Operator end-of-input only stops the input relay; the plugin keeps running
/// and its remaining output is still interpreted.
pub(crate) fn pump<M, I, W>(
    master: &mut M,
    input: Option<&I>,
    interpreter: &mut Interpreter,
    output: &mut W,
) -> Result<()>
where
    M: AsFd + Write,
    I: AsFd,
    W: Write,
{
    let mut watch_input = input.is_some();
    loop {
        let (master_ready, input_ready) = {
            let mut fds = vec![PollFd::new(master.as_fd(), PollFlags::POLLIN)];
            if watch_input {
                if let Some(input) = input {
                    fds.push(PollFd::new(input.as_fd(), PollFlags::POLLIN));
                }
            }
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("unable to poll plugin terminal"),
            }
            let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            let master_ready = fds[0].revents().is_some_and(|r| r.intersects(readable));
            let input_ready = fds
                .get(1)
                .and_then(|fd| fd.revents())
                .is_some_and(|r| r.intersects(readable));
            (master_ready, input_ready)
        };

        if master_ready {
            match read_line_fd(master.as_fd())? {
                Some(line) => {
                    interpreter.interpret(&line, output).context("unable to write plugin output")?;
                    output.flush().ok();
                }
                // the plugin closed the terminal; the conversation is over
                None => break,
            }
        }

        if input_ready {
            match input.map(|input| read_line_fd(input.as_fd())).transpose()? {
                Some(Some(line)) => {
                    writeln!(master, "{line}").context("unable to forward input to plugin")?
                }
                _ => watch_input = false,
            }
        }
    }
    Ok(())
}

/// Read one newline-terminated line from a raw descriptor.
///
/// Returns `None` on end of file. A pty master raises `EIO` once the slave
/// side is fully closed, which counts as end of file here.
fn read_line_fd(fd: BorrowedFd<'_>) -> Result<Option<String>> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match nix::unistd::read(fd.as_raw_fd(), &mut byte) {
            Ok(0) | Err(Errno::EIO) => {
                if line.is_empty() {
                    return Ok(None);
                }
                break;
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                if byte[0] != b'\r' {
                    line.push(byte[0]);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("unable to read plugin terminal"),
        }
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}
