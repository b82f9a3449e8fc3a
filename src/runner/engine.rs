use super::wrapper::quote_path;
use serde::{Deserialize, Serialize};
use std::env;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

/// An external program that can execute MATLAB scripts
/// `{script}` and `{dir}` in the arguments expand to the script path and the working directory.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Engine {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Engine {
    pub fn matlab() -> Self {
        Self {
            name: String::from("matlab"),
            program: String::from("matlab"),
            args: vec![String::from("-batch"), String::from("run('{script}')")],
        }
    }

    pub fn octave() -> Self {
        Self {
            name: String::from("octave"),
            program: String::from("octave"),
            args: vec![
                String::from("--no-gui"),
                String::from("--quiet"),
                String::from("--eval"),
                String::from("run('{script}')"),
            ],
        }
    }

    /// Build the command that executes `script` inside `work_dir`
    pub fn command(&self, script: &Path, work_dir: &Path) -> Command {
        let script = quote_path(script);
        let dir = quote_path(work_dir);
        let mut command = Command::new(&self.program);
        command
            .args(
                self.args
                    .iter()
                    .map(|arg| arg.replace("{script}", &script).replace("{dir}", &dir)),
            )
            .current_dir(work_dir)
            .stdin(Stdio::null());
        // Engines fork their own workers, so give them a group that can be killed as a whole
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    /// Determine whether the engine's program can be found
    pub fn is_available(&self) -> bool {
        let program = Path::new(&self.program);
        if program.components().count() > 1 {
            return program.is_file();
        }

        env::var_os("PATH").map_or(false, |paths| {
            env::split_paths(&paths).any(|dir| {
                let candidate = dir.join(program);
                candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_expands_placeholders() {
        let engine = Engine {
            name: String::from("test"),
            program: String::from("runner"),
            args: vec![
                String::from("--cwd={dir}"),
                String::from("run('{script}')"),
            ],
        };
        let command = engine.command(Path::new("/jobs/1/wrapper.m"), Path::new("/jobs/1"));
        assert_eq!(command.get_program(), "runner");
        assert_eq!(
            command.get_args().collect::<Vec<_>>(),
            vec!["--cwd=/jobs/1", "run('/jobs/1/wrapper.m')"]
        );
        assert_eq!(command.get_current_dir(), Some(Path::new("/jobs/1")));
    }

    #[test]
    fn test_default_engines() {
        assert_eq!(Engine::matlab().args, vec!["-batch", "run('{script}')"]);
        assert_eq!(Engine::octave().program, "octave");
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let engine = Engine {
            name: String::from("missing"),
            program: String::from("mrun-engine-that-does-not-exist"),
            args: vec![],
        };
        assert!(!engine.is_available());

        let engine = Engine {
            name: String::from("missing"),
            program: String::from("/nonexistent/bin/matlab"),
            args: vec![],
        };
        assert!(!engine.is_available());
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_is_available() {
        let engine = Engine {
            name: String::from("shell"),
            program: String::from("sh"),
            args: vec![],
        };
        assert!(engine.is_available());
    }
}
