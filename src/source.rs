// 📦 Monthly source preparation
// Turns a publication page, an archive URL, a zip archive, or a directory into the
// month's export files.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use reqwest::Url;
use scraper::{Html, Selector};
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;
use zip::ZipArchive;

use crate::error::{IndexError, Result};
use crate::month::Month;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonthSource {
    /// Directory holding already-unpacked export files
    Directory(PathBuf),
    /// Local zip archive
    Archive(PathBuf),
    /// Remote zip archive
    Url(String),
    /// Explicit list of export files
    Files(Vec<PathBuf>),
    /// Base URL of the monthly publication pages; the archive link is read
    /// from the month's page
    Publication(String),
}

impl MonthSource {
    /// Interpret a user-supplied location: http(s) URL, `.zip` file, or directory
    pub fn parse(location: &str) -> Self {
        let trimmed = location.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            MonthSource::Url(trimmed.to_string())
        } else if trimmed.to_lowercase().ends_with(".zip") {
            MonthSource::Archive(PathBuf::from(trimmed))
        } else {
            MonthSource::Directory(PathBuf::from(trimmed))
        }
    }

    pub fn location(&self) -> String {
        match self {
            MonthSource::Directory(path) | MonthSource::Archive(path) => path.display().to_string(),
            MonthSource::Url(url) | MonthSource::Publication(url) => url.clone(),
            MonthSource::Files(files) => format!("{} files", files.len()),
        }
    }
}

/// Export files ready to parse. Any unpacked archive lives in a temporary
/// directory that is removed when this value is dropped.
#[derive(Debug)]
pub struct PreparedSource {
    pub files: Vec<PathBuf>,
    _workdir: Option<TempDir>,
}

/// Resolve a source into the month's export files
pub fn prepare(source: &MonthSource, month: &Month, download_timeout: Duration) -> Result<PreparedSource> {
    match source {
        MonthSource::Files(files) => Ok(PreparedSource {
            files: files.clone(),
            _workdir: None,
        }),
        MonthSource::Directory(dir) => Ok(PreparedSource {
            files: export_files_in(dir, month)?,
            _workdir: None,
        }),
        MonthSource::Archive(path) => {
            let workdir = TempDir::new()?;
            unpack_archive(path, workdir.path()).map_err(|e| IndexError::parse(month, e.to_string()))?;
            Ok(PreparedSource {
                files: export_files_in(workdir.path(), month)?,
                _workdir: Some(workdir),
            })
        }
        MonthSource::Publication(base_url) => {
            let page_url = format!("{}/{}", base_url.trim_end_matches('/'), month.publication_slug());
            let archive_url = find_archive_link(&page_url, download_timeout)?;
            prepare(&MonthSource::Url(archive_url), month, download_timeout)
        }
        MonthSource::Url(url) => {
            let workdir = TempDir::new()?;
            let archive_path = workdir.path().join(format!("{}.zip", month));
            download(url, &archive_path, download_timeout)?;

            let unpack_dir = workdir.path().join(month.as_str());
            unpack_archive(&archive_path, &unpack_dir).map_err(|e| IndexError::parse(month, e.to_string()))?;
            Ok(PreparedSource {
                files: export_files_in(&unpack_dir, month)?,
                _workdir: Some(workdir),
            })
        }
    }
}

/// Practice-level files for the month: names ending with e.g. `Jan_25.csv`,
/// searched recursively since archives sometimes nest a folder
pub fn export_files_in(dir: &Path, month: &Month) -> Result<Vec<PathBuf>> {
    let suffix = month.export_file_suffix();
    let mut files = Vec::new();
    collect_matching(dir, &suffix, &mut files)?;
    files.sort();

    info!(month = %month, dir = %dir.display(), found = files.len(), "Located export files");

    if files.is_empty() {
        return Err(IndexError::parse(
            month,
            format!("no export files ending with {} in {}", suffix, dir.display()),
        ));
    }

    Ok(files)
}

fn collect_matching(dir: &Path, suffix: &str, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_matching(&path, suffix, files)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(suffix))
            .unwrap_or(false)
        {
            files.push(path);
        }
    }
    Ok(())
}

/// Href of the "Annex 1" CSV download card on a publication page.
///
/// Each `div.nhsd-m-download-card` carries its title in the first `<p>` and the
/// archive in the first `<a href>`, wherever they sit inside the card.
pub fn annex_link_from_page(html: &str) -> Option<String> {
    let cards = Selector::parse("div.nhsd-m-download-card").ok()?;
    let title = Selector::parse("p").ok()?;
    let link = Selector::parse("a[href]").ok()?;

    let document = Html::parse_document(html);
    document.select(&cards).find_map(|card| {
        let heading: String = card
            .select(&title)
            .next()
            .map(|p| p.text().collect())
            .unwrap_or_else(|| card.text().collect());

        if !(heading.contains("Annex 1") && heading.contains("CSV")) {
            return None;
        }

        card.select(&link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| href.trim().to_string())
    })
}

fn find_archive_link(page_url: &str, timeout: Duration) -> Result<String> {
    info!(page = page_url, "Finding archive link on publication page");

    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| IndexError::download(page_url, e))?;

    let html = client
        .get(page_url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .map_err(|e| IndexError::download(page_url, e))?;

    let href = annex_link_from_page(&html)
        .ok_or_else(|| IndexError::download(page_url, "no Annex 1 CSV download on publication page"))?;

    Url::parse(page_url)
        .and_then(|base| base.join(&href))
        .map(String::from)
        .map_err(|e| IndexError::download(page_url, e))
}

fn download(url: &str, destination: &Path, timeout: Duration) -> Result<()> {
    info!(url, "Downloading monthly archive");

    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| IndexError::download(url, e))?;

    let mut response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| IndexError::download(url, e))?;

    let mut file = File::create(destination)?;
    let bytes = io::copy(&mut response, &mut file).map_err(|e| IndexError::download(url, e))?;

    info!(url, bytes, "Downloaded monthly archive");
    Ok(())
}

fn unpack_archive(archive_path: &Path, destination: &Path) -> std::result::Result<usize, zip::result::ZipError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    fs::create_dir_all(destination)?;
    archive.extract(destination)?;

    info!(archive = %archive_path.display(), entries = archive.len(), "Unpacked archive");
    Ok(archive.len())
}
