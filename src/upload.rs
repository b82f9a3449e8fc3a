use crate::config::Config;
use crate::error::JobError;
use crate::script_check::check_script;
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

const MAX_NAME_LEN: usize = 100;
// MATLAB's namelengthmax
const MAX_IDENTIFIER_LEN: usize = 63;

lazy_static! {
    static ref UNSAFE_CHARS: Regex = Regex::new(r"[^A-Za-z0-9_.-]").unwrap();
    static ref NON_IDENTIFIER_CHARS: Regex = Regex::new(r"[^A-Za-z0-9_]").unwrap();
}

/// Determine whether a filename has the `.m` extension
pub fn allowed_file(name: &str) -> bool {
    name.rsplit_once('.')
        .map_or(false, |(_, extension)| extension.eq_ignore_ascii_case("m"))
}

/// Reduce a client-provided filename to a safe file name
/// Directory components are dropped, whitespace becomes underscores, anything outside of `[A-Za-z0-9_.-]` is removed,
/// and the result is capped at 100 characters while keeping the extension. Returns `None` if nothing is left.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let name = name.split_whitespace().collect::<Vec<_>>().join("_");
    let name = UNSAFE_CHARS.replace_all(&name, "");
    let name = name.trim_matches(['.', '_']);
    if name.is_empty() {
        return None;
    }

    // Only ASCII characters are left, so byte offsets are character offsets
    if name.len() > MAX_NAME_LEN {
        let (stem, extension) = match name.rsplit_once('.') {
            Some((stem, extension)) => (stem, format!(".{extension}")),
            None => (name, String::new()),
        };
        let keep = MAX_NAME_LEN.saturating_sub(extension.len()).min(stem.len());
        return Some(format!("{}{extension}", &stem[..keep]));
    }

    Some(name.to_owned())
}

/// Turn a sanitized script name into a file name that MATLAB can invoke as a script
fn script_file_name(name: &str) -> String {
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    let mut identifier = NON_IDENTIFIER_CHARS.replace_all(stem, "_").into_owned();
    if !identifier.starts_with(|char: char| char.is_ascii_alphabetic()) {
        identifier = format!("script_{identifier}");
    }
    identifier.truncate(MAX_IDENTIFIER_LEN);
    format!("{identifier}.m")
}

/// A validated script upload that hasn't been stored yet
#[derive(Debug)]
pub struct ScriptUpload {
    /// The sanitized name that the user sees
    pub file_name: String,
    /// Issues reported by the script check
    pub warnings: Vec<String>,
    contents: Vec<u8>,
}

impl ScriptUpload {
    /// Validate an uploaded file by its client-provided name and its contents
    pub fn new(file_name: &str, contents: Vec<u8>, config: &Config) -> Result<Self, JobError> {
        if file_name.trim().is_empty() {
            return Err(JobError::InvalidUpload(String::from("No file selected")));
        }
        if !allowed_file(file_name) {
            return Err(JobError::InvalidUpload(String::from(
                "Only .m files are allowed",
            )));
        }
        let file_name = sanitize_filename(file_name)
            .filter(|name| allowed_file(name))
            .ok_or_else(|| JobError::InvalidUpload(String::from("Invalid filename")))?;
        if contents.len() > config.max_upload_size {
            return Err(JobError::UploadTooLarge {
                limit: config.max_upload_size,
            });
        }

        let warnings = check_script(&String::from_utf8_lossy(&contents));
        if config.strict_scripts && !warnings.is_empty() {
            return Err(JobError::InvalidUpload(format!(
                "Script failed the safety check: {}",
                warnings.join("; ")
            )));
        }

        Ok(Self {
            file_name,
            warnings,
            contents,
        })
    }

    /// Write the script into the given directory and return its path
    pub fn store(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create upload dir {}", dir.display()))?;
        let path = dir.join(script_file_name(&self.file_name));
        fs::write(&path, &self.contents)
            .with_context(|| format!("Failed to write script {}", path.display()))?;
        Ok(path)
    }
}
