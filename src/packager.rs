use crate::database::Job;
use crate::error::JobError;
use anyhow::Context;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Logs,
    Images,
    Data,
    Scripts,
    Other,
}

impl Category {
    pub const ALL: [Self; 5] = [
        Self::Logs,
        Self::Images,
        Self::Data,
        Self::Scripts,
        Self::Other,
    ];

    /// Classify a file by its extension
    pub fn of(path: &Path) -> Self {
        let extension = path
            .extension()
            .map(|extension| extension.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "txt" | "log" => Self::Logs,
            "png" | "jpg" | "jpeg" | "pdf" | "svg" | "eps" => Self::Images,
            "mat" | "csv" | "xlsx" | "xls" => Self::Data,
            "m" => Self::Scripts,
            _ => Self::Other,
        }
    }

    /// The folder that files in this category are placed in inside the archive
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Logs => "logs",
            Self::Images => "images",
            Self::Data => "data",
            Self::Scripts => "scripts",
            Self::Other => "other",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Logs => "Console output and log files",
            Self::Images => "Plots and figures (png, jpg, pdf, svg, eps)",
            Self::Data => "Saved data (mat, csv, xlsx, xls)",
            Self::Scripts => "MATLAB scripts",
            Self::Other => "Any other files the script created",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResultFile {
    #[serde(skip)]
    pub path: PathBuf,
    /// Path relative to the result directory, always with `/` separators
    pub name: String,
    pub category: Category,
    pub size: u64,
}

impl ResultFile {
    fn archive_name(&self) -> String {
        format!("{}/{}", self.category.prefix(), self.name)
    }
}

/// Recursively list the files in a job's result directory, sorted by name
pub fn list_results(job: &Job) -> Result<Vec<ResultFile>, JobError> {
    let dir = job
        .result_path
        .as_deref()
        .filter(|dir| dir.is_dir())
        .ok_or(JobError::NoResults(job.id))?;

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|_| JobError::NoResults(job.id))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path().to_owned();
        let name = path
            .strip_prefix(dir)
            .context("Result file is outside of the result dir")?
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry
            .metadata()
            .map_err(|_| JobError::NoResults(job.id))?
            .len();
        files.push(ResultFile {
            category: Category::of(&path),
            path,
            name,
            size,
        });
    }
    Ok(files)
}

/// A finished ZIP archive of a job's results
#[derive(Debug)]
pub struct Archive {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Package a job's result directory and its uploaded script into a ZIP archive
/// Files are placed under a folder named after their category, and a README.txt summary is added at the root.
pub fn package(job: &Job) -> Result<Archive, JobError> {
    let mut files = list_results(job)?;

    // Include the uploaded script unless the script saved a copy of itself
    if job.script_path.is_file() {
        let name = job
            .script_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.script_name.clone());
        if !files
            .iter()
            .any(|file| file.category == Category::Scripts && file.name == name)
        {
            let size = job
                .script_path
                .metadata()
                .context("Failed to read uploaded script metadata")?
                .len();
            files.push(ResultFile {
                path: job.script_path.clone(),
                name,
                category: Category::Scripts,
                size,
            });
        }
    }

    let mut counts = Category::ALL
        .into_iter()
        .map(|category| (category, 0))
        .collect::<BTreeMap<_, _>>();
    for file in &files {
        *counts.entry(file.category).or_default() += 1;
    }

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for file in &files {
        zip.start_file(file.archive_name(), options)
            .with_context(|| format!("Failed to add {} to the archive", file.name))?;
        let mut source = File::open(&file.path)
            .with_context(|| format!("Failed to open result file {}", file.path.display()))?;
        io::copy(&mut source, &mut zip)
            .with_context(|| format!("Failed to compress result file {}", file.path.display()))?;
    }
    zip.start_file("README.txt", options)
        .context("Failed to add README.txt to the archive")?;
    zip.write_all(readme(job, &counts).as_bytes())
        .context("Failed to write README.txt")?;
    let bytes = zip
        .finish()
        .context("Failed to finish the archive")?
        .into_inner();

    let stem = job
        .script_name
        .rsplit_once('.')
        .map_or(job.script_name.as_str(), |(stem, _)| stem);
    Ok(Archive {
        file_name: format!("results_{stem}_{}.zip", job.id),
        bytes,
    })
}

fn format_timestamp(timestamp: Option<NaiveDateTime>) -> String {
    timestamp.map_or_else(
        || String::from("N/A"),
        |timestamp| timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

/// Summarize the job and the archive's layout
fn readme(job: &Job, counts: &BTreeMap<Category, usize>) -> String {
    let mut readme = String::from("MATLAB Script Execution Results\n===============================\n\n");
    let duration = job.duration().map_or_else(
        || String::from("N/A"),
        |duration| format!("{:.2} seconds", duration.num_milliseconds() as f64 / 1000.0),
    );
    // Writing to a String can't fail
    let _ = writeln!(readme, "Script:   {}", job.script_name);
    let _ = writeln!(readme, "Status:   {}", job.status.as_str().to_uppercase());
    let _ = writeln!(readme, "Engine:   {}", job.engine.as_deref().unwrap_or("N/A"));
    let _ = writeln!(readme, "Uploaded: {}", format_timestamp(Some(job.created_at)));
    let _ = writeln!(readme, "Finished: {}", format_timestamp(job.finished_at));
    let _ = writeln!(readme, "Duration: {duration}");
    if let Some(error) = &job.error_message {
        let _ = writeln!(readme, "Error:    {error}");
    }

    readme.push_str("\nFolders\n-------\n");
    for category in Category::ALL {
        let _ = writeln!(
            readme,
            "{:<9} {}",
            format!("{}/", category.prefix()),
            category.description()
        );
    }

    readme.push_str("\nFiles\n-----\n");
    for (category, count) in counts {
        let _ = writeln!(readme, "{:<9} {count}", category.prefix());
    }
    let _ = writeln!(readme, "{:<9} {}", "total", counts.values().sum::<usize>());
    readme
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::JobStatus;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn job(dir: &TempDir) -> Job {
        let script_path = dir.path().join("uploads").join("test_script.m");
        fs::create_dir_all(script_path.parent().unwrap()).unwrap();
        fs::write(&script_path, "disp('Hello from MATLAB!')").unwrap();
        let now = Utc::now().naive_utc();
        Job {
            id: 7,
            script_name: String::from("test_script.m"),
            script_path,
            result_path: Some(dir.path().join("results")),
            status: JobStatus::Completed,
            engine: Some(String::from("octave")),
            execution_log: Some(String::from("Hello from MATLAB!")),
            error_message: None,
            created_at: now,
            started_at: Some(now),
            finished_at: Some(now),
        }
    }

    fn write_results(dir: &TempDir) {
        let results = dir.path().join("results");
        fs::create_dir_all(results.join("nested")).unwrap();
        fs::write(results.join("log.txt"), "Hello from MATLAB!").unwrap();
        fs::write(results.join("figure_1.png"), [0x89, b'P', b'N', b'G']).unwrap();
        fs::write(results.join("Data.MAT"), "matrix").unwrap();
        fs::write(results.join("nested").join("table.csv"), "a,b\n1,2\n").unwrap();
        fs::write(results.join("notes.bin"), "??").unwrap();
    }

    #[test]
    fn test_category() {
        assert_eq!(Category::of(Path::new("log.txt")), Category::Logs);
        assert_eq!(Category::of(Path::new("engine.LOG")), Category::Logs);
        assert_eq!(Category::of(Path::new("figure.png")), Category::Images);
        assert_eq!(Category::of(Path::new("figure.Jpeg")), Category::Images);
        assert_eq!(Category::of(Path::new("report.pdf")), Category::Images);
        assert_eq!(Category::of(Path::new("result.mat")), Category::Data);
        assert_eq!(Category::of(Path::new("table.xlsx")), Category::Data);
        assert_eq!(Category::of(Path::new("helper.m")), Category::Scripts);
        assert_eq!(Category::of(Path::new("archive.tar.gz")), Category::Other);
        assert_eq!(Category::of(Path::new("Makefile")), Category::Other);
    }

    #[test]
    fn test_list_results() {
        let dir = TempDir::new().unwrap();
        write_results(&dir);
        let files = list_results(&job(&dir)).unwrap();
        assert_eq!(
            files
                .iter()
                .map(|file| (file.name.as_str(), file.category))
                .collect::<Vec<_>>(),
            vec![
                ("Data.MAT", Category::Data),
                ("figure_1.png", Category::Images),
                ("log.txt", Category::Logs),
                ("nested/table.csv", Category::Data),
                ("notes.bin", Category::Other),
            ]
        );
        assert_eq!(files[2].size, 18);
    }

    #[test]
    fn test_package() {
        let dir = TempDir::new().unwrap();
        write_results(&dir);
        let archive = package(&job(&dir)).unwrap();
        assert_eq!(archive.file_name, "results_test_script_7.zip");

        let mut zip = ZipArchive::new(Cursor::new(archive.bytes)).unwrap();
        let mut names = zip.file_names().map(str::to_owned).collect::<Vec<_>>();
        names.sort();
        assert_eq!(
            names,
            vec![
                "README.txt",
                "data/Data.MAT",
                "data/nested/table.csv",
                "images/figure_1.png",
                "logs/log.txt",
                "other/notes.bin",
                "scripts/test_script.m",
            ]
        );

        let mut log = String::new();
        zip.by_name("logs/log.txt")
            .unwrap()
            .read_to_string(&mut log)
            .unwrap();
        assert_eq!(log, "Hello from MATLAB!");

        let mut readme = String::new();
        zip.by_name("README.txt")
            .unwrap()
            .read_to_string(&mut readme)
            .unwrap();
        assert!(readme.contains("Script:   test_script.m"));
        assert!(readme.contains("Status:   COMPLETED"));
        assert!(readme.contains("images    1"));
        assert!(readme.contains("data      2"));
        assert!(readme.contains("scripts   1"));
        assert!(readme.contains("total     6"));
    }

    #[test]
    fn test_package_empty_dir() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("results")).unwrap();
        let archive = package(&job(&dir)).unwrap();
        let zip = ZipArchive::new(Cursor::new(archive.bytes)).unwrap();
        assert_eq!(zip.len(), 2);
    }

    #[test]
    fn test_missing_dir() {
        let dir = TempDir::new().unwrap();
        let mut job = job(&dir);
        assert_matches!(package(&job), Err(JobError::NoResults(7)));

        job.result_path = None;
        assert_matches!(package(&job), Err(JobError::NoResults(7)));
        assert_matches!(list_results(&job), Err(JobError::NoResults(7)));
    }
}
