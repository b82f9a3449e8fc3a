use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

pub const WRAPPER_NAME: &str = "wrapper_script.m";

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,62}$").unwrap();
}

/// Quote a path for use inside a single-quoted MATLAB string literal
pub fn quote_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").replace('\'', "''")
}

/// Determine whether a name can be invoked as a MATLAB script
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Generate the script that the engine is pointed at
///
/// It keeps figures off screen, runs the user's script from the working directory so that relative output paths land
/// there, reports errors with their stack and a non-zero exit status, and saves any figures left open as PNG files.
pub fn render(script: &Path, work_dir: &Path) -> String {
    let script_dir = script.parent().unwrap_or_else(|| Path::new("."));

    // Invoking the script by name keeps the current directory, while run() switches to the script's directory
    let invocation = match script.file_stem().and_then(|stem| stem.to_str()) {
        Some(stem) if is_identifier(stem) => format!("{stem};"),
        _ => format!("run('{}');", quote_path(script)),
    };

    format!(
        r"% Generated by mrun, removed after the run
set(0, 'DefaultFigureVisible', 'off');
cd('{work_dir}');
addpath('{script_dir}');
try
    {invocation}
catch err
    fprintf(2, 'Error during execution: %s\n', err.message);
    for k = 1:numel(err.stack)
        fprintf(2, '  File: %s, Function: %s, Line: %d\n', err.stack(k).file, err.stack(k).name, err.stack(k).line);
    end
    exit(1);
end
figures = findall(0, 'Type', 'figure');
for k = 1:numel(figures)
    print(figures(k), sprintf('figure_%d.png', k), '-dpng');
end
close all;
",
        work_dir = quote_path(work_dir),
        script_dir = quote_path(script_dir),
    )
}
