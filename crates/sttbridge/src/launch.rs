//! Launch-mode selection for the worker target.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Extensions spawned without an interpreter (Windows executables, macOS bundles).
const DIRECT_EXTENSIONS: &[&str] = &["exe", "app"];

/// Default interpreter for script targets.
pub const DEFAULT_INTERPRETER: &str = "python";

/// How the worker target is launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LaunchMode {
    /// Decide from the target path (see [`LaunchMode::detect`]).
    #[default]
    Auto,
    /// Spawn the target itself.
    Direct,
    /// Spawn the interpreter with the target as its only argument.
    Interpreter,
}

impl LaunchMode {
    /// Pure function of the path: no extension or a binary/bundle extension
    /// means direct, anything else goes through the interpreter.
    pub fn detect(target: &Path) -> Self {
        match target.extension().and_then(|ext| ext.to_str()) {
            None => Self::Direct,
            Some(ext)
                if DIRECT_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known)) =>
            {
                Self::Direct
            }
            // Non-UTF-8 extensions are never one of ours.
            Some(_) => Self::Interpreter,
        }
    }

    /// Resolve `Auto` against the target; explicit modes are kept.
    pub fn resolve(self, target: &Path) -> Self {
        match self {
            Self::Auto => Self::detect(target),
            explicit => explicit,
        }
    }
}

/// Concrete program and arguments to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub mode: LaunchMode,
}

impl LaunchPlan {
    pub fn new(target: &Path, mode: LaunchMode, interpreter: &Path) -> Self {
        match mode.resolve(target) {
            LaunchMode::Interpreter => Self {
                program: interpreter.as_os_str().to_owned(),
                args: vec![target.as_os_str().to_owned()],
                mode: LaunchMode::Interpreter,
            },
            _ => Self {
                program: target.as_os_str().to_owned(),
                args: Vec::new(),
                mode: LaunchMode::Direct,
            },
        }
    }

    pub fn direct(target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        Self::new(&target, LaunchMode::Direct, Path::new(DEFAULT_INTERPRETER))
    }
}

impl std::fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_direct_targets() {
        for target in [
            "transcriber",
            "dist/transcriber.exe",
            "C:/tools/Transcriber.EXE",
            "/Applications/Transcriber.app",
            "./bin/worker",
        ] {
            assert_eq!(LaunchMode::detect(Path::new(target)), LaunchMode::Direct, "{target}");
        }
    }

    #[test]
    fn detect_interpreter_targets() {
        for target in ["electron_transcriber.py", "/opt/worker/run.pyw", "worker.sh"] {
            assert_eq!(
                LaunchMode::detect(Path::new(target)),
                LaunchMode::Interpreter,
                "{target}"
            );
        }
    }

    #[test]
    fn dotted_parent_directory_is_not_an_extension() {
        assert_eq!(
            LaunchMode::detect(Path::new("/home/j.doe/bin/transcriber")),
            LaunchMode::Direct
        );
    }

    #[test]
    fn explicit_mode_wins_over_detection() {
        let target = Path::new("worker.py");
        assert_eq!(LaunchMode::Direct.resolve(target), LaunchMode::Direct);
        assert_eq!(LaunchMode::Auto.resolve(target), LaunchMode::Interpreter);
    }

    #[test]
    fn interpreter_plan_passes_target_as_sole_argument() {
        let plan = LaunchPlan::new(
            Path::new("electron_transcriber.py"),
            LaunchMode::Auto,
            Path::new("python3"),
        );
        assert_eq!(plan.mode, LaunchMode::Interpreter);
        assert_eq!(plan.program, OsString::from("python3"));
        assert_eq!(plan.args, vec![OsString::from("electron_transcriber.py")]);
        assert_eq!(plan.to_string(), "python3 electron_transcriber.py");
    }

    #[test]
    fn direct_plan_has_no_arguments() {
        let plan = LaunchPlan::direct("dist/transcriber.exe");
        assert_eq!(plan.mode, LaunchMode::Direct);
        assert_eq!(plan.program, OsString::from("dist/transcriber.exe"));
        assert!(plan.args.is_empty());
    }
}
