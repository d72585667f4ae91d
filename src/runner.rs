//! Subprocess execution facade.
//!
//! Wrappers use [`run`] to capture tool output (version banners,
//! preprocessor runs, the real compile on a miss). [`passthrough`] hands
//! the terminal to the child unchanged and is used whenever the cache
//! steps aside.

use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

/// Captured output of a finished subprocess.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub return_code: i32,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }
}

/// Run a program and capture stdout, stderr, and the return code.
pub fn run(program: &Path, args: &[String], work_dir: &Path) -> io::Result<RunResult> {
    debug!("running {} {}", program.display(), args.join(" "));
    let output = Command::new(program)
        .args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .output()?;

    Ok(RunResult {
        stdout: output.stdout,
        stderr: output.stderr,
        // A None status code means the child died from a signal; report
        // a generic failure code in that case.
        return_code: output.status.code().unwrap_or(-1),
    })
}

/// Run a program with inherited stdio and return its exit code.
pub fn passthrough(program: &Path, args: &[String], work_dir: &Path) -> io::Result<i32> {
    debug!("passthrough exec: {} {}", program.display(), args.join(" "));
    let status = Command::new(program)
        .args(args)
        .current_dir(work_dir)
        .status()?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::path::PathBuf;

    fn cwd() -> PathBuf {
        env::current_dir().unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout_and_return_code() {
        let result = run(
            Path::new("/bin/sh"),
            &["-c".to_string(), "printf hello; exit 3".to_string()],
            &cwd(),
        )
        .unwrap();

        assert_eq!(result.stdout, b"hello");
        assert_eq!(result.return_code, 3);
        assert!(!result.success());
    }

    #[cfg(unix)]
    #[test]
    fn captures_stderr() {
        let result = run(
            Path::new("/bin/sh"),
            &["-c".to_string(), "printf err >&2".to_string()],
            &cwd(),
        )
        .unwrap();

        assert_eq!(result.stderr, b"err");
        assert_eq!(result.return_code, 0);
    }

    #[test]
    fn missing_program_is_an_io_error() {
        let err = run(Path::new("/no/such/program"), &[], &cwd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
