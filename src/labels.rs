//! Retrieval of the class-name list the demo application displays.
//!
//! The source is a plain-text synset file, one class per line, fetched over
//! HTTP. It is rewritten as a JSON array of bare class names so the consumer
//! needs no synset handling. The download is independent of the model
//! stages; a failure here never invalidates produced artifacts.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Errors from fetching or writing the labels file.
#[derive(Debug)]
pub enum LabelsError {
    /// The download failed: connection, DNS, or a non-success HTTP status.
    Network(reqwest::Error),

    /// Serializing the label list failed.
    Json(serde_json::Error),

    /// Writing the labels file failed.
    Io(io::Error),
}

impl fmt::Display for LabelsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelsError::Network(err) => write!(f, "label download failed: {}", err),
            LabelsError::Json(err) => write!(f, "label encoding failed: {}", err),
            LabelsError::Io(err) => write!(f, "failed to write labels: {}", err),
        }
    }
}

impl Error for LabelsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LabelsError::Network(err) => Some(err),
            LabelsError::Json(err) => Some(err),
            LabelsError::Io(err) => Some(err),
        }
    }
}

/// Fetch the synset text from `url` and parse it into class names.
pub fn fetch_labels(url: &str) -> Result<Vec<String>, LabelsError> {
    let text = reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.text())
        .map_err(LabelsError::Network)?;
    Ok(parse_synset_labels(&text))
}

/// Parse synset lines (`n01440764 tench, Tinca tinca`) into class names.
///
/// The synset identifier prefix is dropped; lines without one pass through
/// unchanged and blank lines are skipped.
pub fn parse_synset_labels(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            if line.starts_with('n') {
                match line.split_once(' ') {
                    Some((_, name)) => name.to_string(),
                    None => line.to_string(),
                }
            } else {
                line.to_string()
            }
        })
        .collect()
}

/// Write the labels as a pretty-printed JSON array of strings.
pub fn write_labels(labels: &[String], path: &Path) -> Result<(), LabelsError> {
    let json = serde_json::to_vec_pretty(labels).map_err(LabelsError::Json)?;
    fs::write(path, json).map_err(LabelsError::Io)?;
    Ok(())
}

/// Fetch from `url`, write to `path`, and report how many classes landed.
pub fn download_labels(url: &str, path: &Path) -> Result<usize, LabelsError> {
    let labels = fetch_labels(url)?;
    write_labels(&labels, path)?;
    Ok(labels.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TempDir;

    #[test]
    fn synset_prefixes_are_stripped() {
        let text = "n01440764 tench, Tinca tinca\nn01443537 goldfish, Carassius auratus\n";
        let labels = parse_synset_labels(text);
        assert_eq!(
            labels,
            vec![
                "tench, Tinca tinca".to_string(),
                "goldfish, Carassius auratus".to_string(),
            ]
        );
    }

    #[test]
    fn unprefixed_lines_pass_through() {
        let labels = parse_synset_labels("tabby cat\n\n  great white shark  \n");
        assert_eq!(
            labels,
            vec!["tabby cat".to_string(), "great white shark".to_string()]
        );
    }

    #[test]
    fn prefix_without_name_is_kept_whole() {
        let labels = parse_synset_labels("n01440764\n");
        assert_eq!(labels, vec!["n01440764".to_string()]);
    }

    #[test]
    fn written_file_is_a_json_string_array() {
        let dir = TempDir::new("labels-write");
        let path = dir.path().join("imagenet_classes.json");
        let labels = vec!["tench".to_string(), "goldfish".to_string()];
        write_labels(&labels, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let parsed: Vec<String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, labels);
        // Pretty-printed, one entry per line.
        assert!(bytes.contains(&b'\n'));
    }
}
