use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use bulkgen_contracts::images::GeneratedImage;
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::ArchiveError;
use crate::fetch::ImageFetcher;
use crate::{error_chain_text, truncate_text};

pub const ARCHIVE_FILE_NAME: &str = "generated_images.zip";
const PROMPT_EXCERPT_UNITS: usize = 20;

/// In-memory zip holding one entry per generated image.
#[derive(Debug, Clone)]
pub struct Archive {
    pub file_name: String,
    pub entries: Vec<String>,
    pub bytes: Vec<u8>,
}

impl Archive {
    pub fn sha256(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }

    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, ArchiveError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(&self.file_name);
        std::fs::write(&path, &self.bytes)?;
        Ok(path)
    }
}

/// `{index}_{excerpt}.jpeg`, where the excerpt is the first 20 UTF-16 code
/// units of the prompt with every unit outside `[A-Za-z0-9]` replaced by `_`.
/// A character outside the BMP therefore takes two slots and becomes `__`.
///
/// The 1-based index is what keeps names unique; the excerpt is cosmetic.
pub fn archive_entry_name(index: usize, prompt: &str) -> String {
    let excerpt: String = prompt
        .encode_utf16()
        .take(PROMPT_EXCERPT_UNITS)
        .map(|unit| {
            u8::try_from(unit)
                .ok()
                .filter(u8::is_ascii_alphanumeric)
                .map_or('_', char::from)
        })
        .collect();
    format!("{index}_{excerpt}.jpeg")
}

/// Fetches every image in order and packs the raw bytes into a zip.
/// The first failed fetch aborts the whole archive.
pub fn build_archive(
    images: &[GeneratedImage],
    fetcher: &dyn ImageFetcher,
) -> Result<Archive, ArchiveError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut entries = Vec::with_capacity(images.len());

    for (offset, image) in images.iter().enumerate() {
        let index = offset + 1;
        let bytes = fetcher
            .fetch(&image.reference)
            .map_err(|err| ArchiveError::Fetch {
                index,
                reference: truncate_text(&image.reference, 64),
                message: error_chain_text(&err, 512),
                source: err.into(),
            })?;
        let name = archive_entry_name(index, image.prompt.as_str());
        tracing::debug!(entry = %name, bytes = bytes.len(), "adding archive entry");
        writer.start_file(name.as_str(), options)?;
        writer.write_all(&bytes)?;
        entries.push(name);
    }

    let bytes = writer.finish()?.into_inner();
    Ok(Archive {
        file_name: ARCHIVE_FILE_NAME.to_string(),
        entries,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::{Cursor, Read};
    use std::sync::Mutex;

    use anyhow::{bail, Result};
    use bulkgen_contracts::images::GeneratedImage;
    use bulkgen_contracts::prompts::Prompt;
    use zip::ZipArchive;

    use super::{archive_entry_name, build_archive, ARCHIVE_FILE_NAME};
    use crate::error::ArchiveError;
    use crate::fetch::ImageFetcher;

    struct MapFetcher {
        blobs: HashMap<String, Vec<u8>>,
        calls: Mutex<Vec<String>>,
    }

    impl MapFetcher {
        fn new(blobs: &[(&str, &[u8])]) -> Self {
            Self {
                blobs: blobs
                    .iter()
                    .map(|(reference, bytes)| (reference.to_string(), bytes.to_vec()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ImageFetcher for MapFetcher {
        fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push(reference.to_string());
            match self.blobs.get(reference) {
                Some(bytes) => Ok(bytes.clone()),
                None => bail!("404 for {reference}"),
            }
        }
    }

    fn image(prompt: &str, reference: &str) -> GeneratedImage {
        GeneratedImage::new(Prompt::new(prompt).unwrap(), reference)
    }

    #[test]
    fn entry_names_are_indexed_and_sanitized() {
        assert_eq!(archive_entry_name(1, "a red fox"), "1_a_red_fox.jpeg");
        assert_eq!(
            archive_entry_name(12, "A cat, sitting on: the mat!!"),
            "12_A_cat__sitting_on__t.jpeg"
        );
        assert_eq!(archive_entry_name(3, "café ☕"), "3_caf___.jpeg");
    }

    #[test]
    fn astral_characters_take_two_excerpt_slots() {
        assert_eq!(archive_entry_name(1, "😀😀😀"), "1_______.jpeg");
        let prompt = format!("{}abcdefghijklmn", "😀".repeat(5));
        assert_eq!(
            archive_entry_name(1, &prompt),
            "1___________abcdefghij.jpeg"
        );
    }

    #[test]
    fn prompt_excerpt_is_capped_at_twenty_characters() {
        let name = archive_entry_name(7, "abcdefghijklmnopqrstuvwxyz");
        assert_eq!(name, "7_abcdefghijklmnopqrst.jpeg");
    }

    #[test]
    fn archive_contains_one_entry_per_image_in_order() -> Result<()> {
        let fetcher = MapFetcher::new(&[("u1", b"one"), ("u2", b"two"), ("u3", b"three")]);
        let images = vec![
            image("a red fox", "u1"),
            image("a red fox", "u2"),
            image("a blue cat", "u3"),
        ];
        let archive = build_archive(&images, &fetcher)?;
        assert_eq!(archive.file_name, ARCHIVE_FILE_NAME);
        assert_eq!(
            archive.entries,
            vec!["1_a_red_fox.jpeg", "2_a_red_fox.jpeg", "3_a_blue_cat.jpeg"]
        );
        assert_eq!(fetcher.calls(), vec!["u1", "u2", "u3"]);

        let mut zip = ZipArchive::new(Cursor::new(archive.bytes.clone()))?;
        assert_eq!(zip.len(), 3);
        let mut contents = String::new();
        zip.by_name("3_a_blue_cat.jpeg")?.read_to_string(&mut contents)?;
        assert_eq!(contents, "three");
        assert_eq!(zip.by_index(0)?.name(), "1_a_red_fox.jpeg");
        Ok(())
    }

    #[test]
    fn same_excerpt_prompts_still_get_distinct_entries() -> Result<()> {
        let fetcher = MapFetcher::new(&[("u1", b"x"), ("u2", b"y")]);
        let images = vec![
            image("same twenty char pre - first", "u1"),
            image("same twenty char pre - second", "u2"),
        ];
        let archive = build_archive(&images, &fetcher)?;
        let zip = ZipArchive::new(Cursor::new(archive.bytes))?;
        assert_eq!(zip.len(), 2);
        Ok(())
    }

    #[test]
    fn fetch_failure_aborts_without_archive() {
        let fetcher = MapFetcher::new(&[("u1", b"one")]);
        let images = vec![
            image("first", "u1"),
            image("second", "missing"),
            image("third", "u1"),
        ];
        let err = build_archive(&images, &fetcher).err();
        match err {
            Some(ArchiveError::Fetch { index, message, .. }) => {
                assert_eq!(index, 2);
                assert_eq!(message, "404 for missing");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(fetcher.calls(), vec!["u1", "missing"]);
    }

    #[test]
    fn empty_input_produces_empty_zip() -> Result<()> {
        let archive = build_archive(&[], &MapFetcher::new(&[]))?;
        assert!(archive.entries.is_empty());
        let zip = ZipArchive::new(Cursor::new(archive.bytes))?;
        assert_eq!(zip.len(), 0);
        Ok(())
    }

    #[test]
    fn write_to_places_archive_in_directory() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let archive = build_archive(&[image("boat", "u1")], &MapFetcher::new(&[("u1", b"b")]))?;
        let path = archive.write_to(&temp.path().join("out"))?;
        assert_eq!(path, temp.path().join("out").join(ARCHIVE_FILE_NAME));
        assert_eq!(std::fs::read(&path)?, archive.bytes);
        assert_eq!(archive.sha256().len(), 64);
        Ok(())
    }
}
