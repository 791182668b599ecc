use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::cli::OutputFormat;
use crate::jobs::{JobItem, JobSnapshot, JobStatus};
use crate::utils::sanitize_filename;

/// Render a finished job for the console
pub fn render(snapshot: &JobSnapshot, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(snapshot).context("Failed to serialize job"),
        OutputFormat::Text => Ok(format_as_text(snapshot)),
    }
}

fn format_as_text(snapshot: &JobSnapshot) -> String {
    let mut sections = Vec::new();

    for item in &snapshot.items {
        let heading = item.title.as_deref().unwrap_or(&item.url);
        let body = match item.status {
            JobStatus::Completed => match (&item.transcript, &item.audio_path) {
                (Some(transcript), _) => transcript.clone(),
                (None, Some(path)) => format!("Audio saved to {}", path.display()),
                (None, None) => "(no transcript)".to_string(),
            },
            JobStatus::Failed => format!("Failed: {}", item.error.as_deref().unwrap_or("unknown error")),
            status => format!("({})", status),
        };

        if snapshot.items.len() == 1 {
            sections.push(body);
        } else {
            sections.push(format!("=== {} ===\n{}", heading, body));
        }
    }

    sections.join("\n\n")
}

/// Print a finished job to stdout
pub fn print_to_console(snapshot: &JobSnapshot, format: OutputFormat) -> Result<()> {
    println!("{}", render(snapshot, format)?);
    Ok(())
}

/// Write a finished job into `dir`, returning the files written.
///
/// Text output gets one file per transcript; JSON output is a single
/// `job_<id>.json` with every item.
pub fn save_to_dir(snapshot: &JobSnapshot, dir: &Path, format: OutputFormat) -> Result<Vec<PathBuf>> {
    fs_err::create_dir_all(dir)?;

    match format {
        OutputFormat::Json => {
            let path = dir.join(format!("job_{}.json", snapshot.id));
            fs_err::write(&path, render(snapshot, format)?)?;
            Ok(vec![path])
        }
        OutputFormat::Text => {
            let mut written = Vec::new();
            for (index, item) in snapshot.items.iter().enumerate() {
                let Some(transcript) = &item.transcript else {
                    continue;
                };
                let path = unique_path(dir, &transcript_stem(item, index), format.extension());
                fs_err::write(&path, transcript)?;
                written.push(path);
            }
            Ok(written)
        }
    }
}

fn transcript_stem(item: &JobItem, index: usize) -> String {
    match (&item.title, &item.video_id) {
        (Some(title), _) => sanitize_filename(title),
        (None, Some(id)) => sanitize_filename(id),
        (None, None) => format!("transcript_{:03}", index + 1),
    }
}

/// `stem.ext`, or `stem (n).ext` if that already exists
fn unique_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let first = dir.join(format!("{}.{}", stem, extension));
    if !first.exists() {
        return first;
    }
    (2..)
        .map(|n| dir.join(format!("{} ({}).{}", stem, n, extension)))
        .find(|path| !path.exists())
        .unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractors::Platform;
    use crate::jobs::{ItemUpdate, Job, JobType};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    async fn finished_job() -> JobSnapshot {
        let items = vec![
            JobItem::new("https://youtu.be/aaaaaaaaaaa", Some(Platform::Youtube), Some("aaaaaaaaaaa".into())),
            JobItem::new("https://youtu.be/bbbbbbbbbbb", Some(Platform::Youtube), Some("bbbbbbbbbbb".into())),
            JobItem::new("https://youtu.be/ccccccccccc", Some(Platform::Youtube), Some("ccccccccccc".into())),
        ];
        let job = Job::new("out00001", JobType::Transcribe, "en", items, CancellationToken::new());
        job.update_item(0, ItemUpdate::completed(Some("first".into())).with_title(Some("Same".into())))
            .await
            .unwrap();
        job.update_item(1, ItemUpdate::completed(Some("second".into())).with_title(Some("Same".into())))
            .await
            .unwrap();
        job.update_item(2, ItemUpdate::failed("Download failed")).await.unwrap();
        job.snapshot().await
    }

    #[tokio::test]
    async fn test_text_lists_every_item() {
        let text = render(&finished_job().await, OutputFormat::Text).unwrap();
        assert!(text.contains("=== Same ===\nfirst"));
        assert!(text.contains("=== https://youtu.be/ccccccccccc ===\nFailed: Download failed"));
    }

    #[tokio::test]
    async fn test_save_text_avoids_collisions() {
        let dir = TempDir::new().unwrap();
        let written = save_to_dir(&finished_job().await, dir.path(), OutputFormat::Text).unwrap();

        assert_eq!(written, vec![dir.path().join("Same.txt"), dir.path().join("Same (2).txt")]);
        assert_eq!(std::fs::read_to_string(&written[1]).unwrap(), "second");
    }

    #[tokio::test]
    async fn test_save_json_single_file() {
        let dir = TempDir::new().unwrap();
        let written = save_to_dir(&finished_job().await, dir.path(), OutputFormat::Json).unwrap();

        assert_eq!(written, vec![dir.path().join("job_out00001.json")]);
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&written[0]).unwrap()).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["failed_count"], 1);
    }
}
