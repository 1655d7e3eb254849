#![allow(dead_code)]

use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use nix::sys::{
    ptrace,
    signal,
    wait::{self, WaitPidFlag, WaitStatus},
};
use pretty_assertions::assert_eq;
use trapdoor::{Pid, Signal, StopStatus, TargetProcess};

const POLL_INTERVAL: Duration = Duration::from_millis(1);
const POLL_ATTEMPTS: usize = 1000;

/// Kills and reaps a spawned child when dropped, so failed tests leave no stopped
/// processes behind.
pub struct Reaper {
    pid: Pid,
}

impl Reaper {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        // Already reaped by the test, so the pid may no longer be ours.
        match wait::waitpid(self.pid, Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG)) {
            Err(_) | Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return,
            Ok(_) => {},
        }

        let _ = signal::kill(self.pid, Signal::SIGKILL);

        while let Ok(status) = wait::waitpid(self.pid, Some(WaitPidFlag::__WALL)) {
            if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
                break;
            }
        }
    }
}

/// Spawn `argv` as a child that requests `PTRACE_TRACEME` before `exec()`, and wait for
/// it to stop on the exec `SIGTRAP`.
pub fn spawn_traced(argv: &[&str]) -> Result<(Reaper, TargetProcess)> {
    let mut cmd = Command::new(argv[0]);
    cmd.args(&argv[1..]);

    // On fork, request `PTRACE_TRACEME`.
    unsafe {
        cmd.pre_exec(|| ptrace::traceme().map_err(|err| io::Error::from_raw_os_error(err as i32)))
    };

    let child = cmd.spawn()?;
    let pid = Pid::from_raw(child.id() as i32);
    let reaper = Reaper::new(pid);

    let mut target = TargetProcess::new(pid, true, false)?;
    expect_status(&mut target, StopStatus::Stopped { signal: Signal::SIGTRAP })?;

    Ok((reaper, target))
}

/// Spawn `argv` untraced, let it finish `exec()`, then attach and wait for the attach
/// `SIGSTOP`.
pub fn spawn_attached(argv: &[&str]) -> Result<(Reaper, TargetProcess)> {
    let child = Command::new(argv[0]).args(&argv[1..]).spawn()?;
    let pid = Pid::from_raw(child.id() as i32);
    let reaper = Reaper::new(pid);

    wait_for_exec(pid)?;

    let mut target = TargetProcess::attach(pid)?;
    drain_until(&mut target, Signal::SIGSTOP)?;

    Ok((reaper, target))
}

/// Spawn `argv` behind a shell that stops itself before `exec()`, attach to it, and run it
/// up to the `SIGTRAP` reported once the new image is loaded.
///
/// The returned target is stopped at the entry point of `argv[0]`, and has never run any
/// of its code.
pub fn spawn_attached_at_entry(argv: &[&str]) -> Result<(Reaper, TargetProcess)> {
    let child = Command::new("sh")
        .args(&["-c", "kill -STOP $$ && exec \"$@\"", "sh"])
        .args(argv)
        .spawn()?;
    let pid = Pid::from_raw(child.id() as i32);
    let reaper = Reaper::new(pid);

    wait_for_state(pid, 'T')?;

    let mut target = TargetProcess::attach(pid)?;

    match target.wait(true)? {
        Some(wait) if matches!(wait.status, StopStatus::Stopped { .. }) => {},
        other => bail!("expected a stop after attaching, got {:?}", other),
    }

    // Discard the stops of the shell until the exec trap.
    target.cont()?;
    drain_until(&mut target, Signal::SIGTRAP)?;

    Ok((reaper, target))
}

/// Block until the next state change, and check it.
pub fn expect_status(target: &mut TargetProcess, expected: StopStatus) -> Result<()> {
    match target.wait(true)? {
        Some(wait) => {
            eprintln!("{}: {:?}", target.pid(), wait.status);
            assert_eq!(wait.status, expected);
        },
        None => bail!("blocking wait returned no event"),
    }

    Ok(())
}

/// Kill a stopped target and reap it.
pub fn kill(target: &mut TargetProcess) -> Result<()> {
    target.kill()?;
    expect_status(target, StopStatus::Signaled { signal: Signal::SIGKILL, core_dumped: false })
}

// Resume past other stops, without delivering `SIGSTOP` or `SIGTRAP`, until the target
// stops with `signal`.
fn drain_until(target: &mut TargetProcess, signal: Signal) -> Result<()> {
    for _ in 0..8 {
        let status = match target.wait(true)? {
            Some(wait) => wait.status,
            None => bail!("blocking wait returned no event"),
        };
        eprintln!("{}: {:?}", target.pid(), status);

        match status {
            StopStatus::Stopped { signal: s } if s == signal => return Ok(()),
            StopStatus::Stopped { signal: Signal::SIGSTOP } => target.cont()?,
            StopStatus::Stopped { signal: s } => target.cont_with_signal(s)?,
            _ => bail!("target did not stop with {:?}, got {:?}", signal, status),
        }
    }

    bail!("target did not stop with {:?}", signal)
}

// Until `exec()` completes, the child is still a copy of the test binary.
fn wait_for_exec(pid: Pid) -> Result<()> {
    let parent = std::env::current_exe()?;

    for _ in 0..POLL_ATTEMPTS {
        if let Ok(exe) = fs::read_link(format!("/proc/{}/exe", pid)) {
            if exe != parent {
                return Ok(());
            }
        }
        thread::sleep(POLL_INTERVAL);
    }

    bail!("process = {} did not exec", pid)
}

fn wait_for_state(pid: Pid, state: char) -> Result<()> {
    for _ in 0..POLL_ATTEMPTS {
        let stat = fs::read_to_string(format!("/proc/{}/stat", pid))?;

        // The state follows the parenthesized command name.
        let current = stat.rfind(')').and_then(|i| stat[i + 1..].trim_start().chars().next());
        if current == Some(state) {
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }

    bail!("process = {} never reached state {}", pid, state)
}

/// Address range of the first mapping of `pid` whose path column is `name`.
pub fn mapping(pid: Pid, name: &str) -> Result<(u64, u64)> {
    let maps = fs::read_to_string(format!("/proc/{}/maps", pid))?;

    for line in maps.lines() {
        if line.split_whitespace().nth(5) != Some(name) {
            continue;
        }

        let range = line.split_whitespace().next().unwrap_or_default();
        if let Some((start, end)) = range.split_once('-') {
            return Ok((u64::from_str_radix(start, 16)?, u64::from_str_radix(end, 16)?));
        }
    }

    bail!("no mapping named {} in process = {}", name, pid)
}
