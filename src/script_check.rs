use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};

const MAX_SCRIPT_BYTES: usize = 1024 * 1024;
const MAX_SCRIPT_LINES: usize = 10_000;

lazy_static! {
    static ref DANGEROUS_PATTERNS: Vec<(Regex, &'static str)> = [
        (r"\bsystem\s*\(", "system() call"),
        (r"(?m)^\s*!", "shell escape (!)"),
        (r"\bdos\s*\(", "dos() call"),
        (r"\bunix\s*\(", "unix() call"),
        (r"\bwinopen\s*\(", "winopen() call"),
        (r"\bweb\s*\(", "web() call"),
        (r"\bdelete\s*\(", "delete() call"),
        (r"\brmdir\s*\(", "rmdir() call"),
        (r"\bmovefile\s*\(", "movefile() call"),
        (r"\bcopyfile\s*\(", "copyfile() call"),
        (r#"\bfopen\s*\(\s*['"][^'"\n]*[/\\]"#, "fopen() outside the working directory"),
        (r#"\bsave\s*\(\s*['"][^'"\n]*[/\\]"#, "save() outside the working directory"),
        (r#"\bload\s*\(\s*['"][^'"\n]*[/\\]"#, "load() outside the working directory"),
    ]
    .into_iter()
    .map(|(pattern, description)| {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .unwrap();
        (regex, description)
    })
    .collect();
}

/// Statically scan a script for commands that reach outside of its sandbox
/// Returns a human-readable description of every issue found. An empty list means that the script looks safe.
pub fn check_script(source: &str) -> Vec<String> {
    let mut issues = DANGEROUS_PATTERNS
        .iter()
        .filter(|(regex, _)| regex.is_match(source))
        .map(|(_, description)| format!("Potentially dangerous command: {description}"))
        .collect::<Vec<_>>();

    if source.len() > MAX_SCRIPT_BYTES {
        issues.push(String::from("Script is larger than 1 MiB"));
    }
    if source.lines().count() > MAX_SCRIPT_LINES {
        issues.push(format!("Script has more than {MAX_SCRIPT_LINES} lines"));
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_script() {
        let source = "disp('Hello from MATLAB!');
total = sum(sum(magic(3)));
x = linspace(0, 2*pi, 100);
plot(x, sin(x));
save('data.mat', 'x');
fid = fopen('out.csv', 'w');";
        assert!(check_script(source).is_empty());
    }

    #[test]
    fn test_dangerous_commands() {
        assert_eq!(
            check_script("system('rm -rf /')"),
            vec!["Potentially dangerous command: system() call"]
        );
        assert_eq!(
            check_script("x = 1;\n  !ls"),
            vec!["Potentially dangerous command: shell escape (!)"]
        );
        assert_eq!(check_script("DELETE ('a.txt')").len(), 1);
        assert_eq!(check_script("x = 1 != 2;").len(), 0);
        assert_eq!(check_script("undelete_count = 3;").len(), 0);
    }

    #[test]
    fn test_absolute_paths() {
        assert_eq!(
            check_script("load('/etc/passwd')"),
            vec!["Potentially dangerous command: load() outside the working directory"]
        );
        assert_eq!(check_script(r#"fopen("C:\secret.txt")"#).len(), 1);
    }

    #[test]
    fn test_limits() {
        let long = "x = 1;\n".repeat(MAX_SCRIPT_LINES + 1);
        assert_eq!(check_script(&long), vec!["Script has more than 10000 lines"]);

        let large = format!("% {}", "a".repeat(MAX_SCRIPT_BYTES));
        assert_eq!(check_script(&large), vec!["Script is larger than 1 MiB"]);
    }
}
