//! Is the process on the other end still alive?
//!
//! A read that times out is not an error by itself; the reader asks here
//! whether the peer can still answer. Zombies count as dead: their socket
//! end is closed only once they are reaped, so a blocked read would never
//! see EOF.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::Path;

/// Whether `pid` names a running, non-zombie process.
pub fn child_running(pid: Pid) -> bool {
    let stat = Path::new("/proc").join(pid.as_raw().to_string()).join("stat");
    match std::fs::read_to_string(&stat) {
        Ok(contents) => process_state(&contents).is_some_and(|state| state != 'Z' && state != 'X'),
        Err(_) if !Path::new("/proc/self").exists() => kill(pid, None).is_ok(),
        Err(_) => false,
    }
}

/// The state letter of a `/proc/<pid>/stat` line.
///
/// The command name is parenthesized and may itself contain `)`, so the
/// state is found after the last one.
fn process_state(stat: &str) -> Option<char> {
    let close = stat.rfind(')')?;
    stat[close + 1..].trim_start().chars().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_state_after_odd_command_names() {
        assert_eq!(process_state("42 (mediafork) S 1 42 42"), Some('S'));
        assert_eq!(process_state("42 (a) b) (c) Z 1 0"), Some('Z'));
        assert_eq!(process_state("garbage"), None);
    }

    #[test]
    fn current_process_is_running() {
        assert!(child_running(nix::unistd::getpid()));
    }

    #[test]
    fn absent_process_is_not_running() {
        // Above the default pid_max on every configuration we run on.
        assert!(!child_running(Pid::from_raw(i32::MAX - 1)));
    }
}
